//! Encode parameter builder.
//!
//! Turns a profile's option pairs and the job's mode flags into the two
//! ordered argument lists handed to the engine: "initial" parameters placed
//! before the input and "additional" parameters placed after it. The engine
//! applies flags positionally, so profile order is preserved exactly.

use crate::layout::{ModeFlags, PLAYLIST_EXTENSION};
use crate::profile::{Profile, ProfileOption};
use crate::records::DownloadPayload;
use std::fmt;
use thiserror::Error;

/// Length of one streaming segment, in seconds.
pub const HLS_SEGMENT_SECONDS: u32 = 4;

/// Playlist type of segmented outputs.
pub const HLS_PLAYLIST_TYPE: &str = "vod";

/// Suffix replacing the playlist extension in segment file names.
pub const SEGMENT_PATTERN_SUFFIX: &str = "_%03d.ts";

#[derive(Debug, Error, PartialEq)]
pub enum ParamsError {
    /// A preview was requested but the batch payload has no clip window.
    #[error("Preview requested but no clip {0} is available in the download payload")]
    MissingClip(&'static str),
}

/// Clip window of a preview encode, in seconds.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ClipWindow {
    pub start_secs: f64,
    pub duration_secs: f64,
}

impl ClipWindow {
    /// Read the clip window from a download batch payload.
    pub fn from_payload(payload: &DownloadPayload) -> Result<Self, ParamsError> {
        let target = payload
            .target
            .as_ref()
            .ok_or(ParamsError::MissingClip("window"))?;

        Ok(Self {
            start_secs: target.start.ok_or(ParamsError::MissingClip("start"))?,
            duration_secs: target.duration.ok_or(ParamsError::MissingClip("duration"))?,
        })
    }
}

/// Engine timecode, `HH:MM:SS.FF` with FF in hundredths of a second.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Timecode {
    hours: u64,
    minutes: u64,
    seconds: u64,
    hundredths: u64,
}

impl Timecode {
    pub fn from_seconds(secs: f64) -> Self {
        let secs = secs.max(0.0);
        let whole = secs.floor();
        let mut total = whole as u64;
        let mut hundredths = ((secs - whole) * 100.0).round() as u64;
        if hundredths >= 100 {
            total += 1;
            hundredths -= 100;
        }

        Self {
            hours: total / 3600,
            minutes: (total % 3600) / 60,
            seconds: total % 60,
            hundredths,
        }
    }
}

impl fmt::Display for Timecode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:02}:{:02}:{:02}.{:02}",
            self.hours, self.minutes, self.seconds, self.hundredths
        )
    }
}

/// Ordered argument lists of one encode.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EncodeParams {
    /// Placed before the input.
    pub initial: Vec<String>,
    /// Placed after the input, controlling the output.
    pub additional: Vec<String>,
}

/// Flatten option pairs to consecutive `key, value` elements.
pub fn flatten_options(options: &[ProfileOption]) -> Vec<String> {
    options
        .iter()
        .flat_map(|option| [option.key.clone(), option.value.clone()])
        .collect()
}

/// Segment file pattern for a playlist path: the `.m3u8` extension is
/// replaced with a zero-padded segment index.
pub fn segment_filename_pattern(playlist_path: &str) -> String {
    let stem = playlist_path
        .strip_suffix(PLAYLIST_EXTENSION)
        .and_then(|rest| rest.strip_suffix('.'))
        .unwrap_or(playlist_path);
    format!("{}{}", stem, SEGMENT_PATTERN_SUFFIX)
}

/// Build the initial and additional parameter lists.
///
/// `playlist_path` is the absolute output path; it is only consulted for
/// segmented-streaming jobs. `clip` is required for previews.
pub fn build_params(
    profile: &Profile,
    mode: ModeFlags,
    clip: Option<&ClipWindow>,
    playlist_path: &str,
) -> Result<EncodeParams, ParamsError> {
    let mut initial = flatten_options(&profile.options);
    let mut additional = flatten_options(&profile.additional_parameters);

    if mode.preview {
        let clip = clip.ok_or(ParamsError::MissingClip("window"))?;
        initial.push("-ss".to_string());
        initial.push(Timecode::from_seconds(clip.start_secs).to_string());
        additional.push("-t".to_string());
        additional.push(Timecode::from_seconds(clip.duration_secs).to_string());
    }

    if mode.segmented_streaming {
        additional.extend([
            "-hls_time".to_string(),
            HLS_SEGMENT_SECONDS.to_string(),
            "-hls_playlist_type".to_string(),
            HLS_PLAYLIST_TYPE.to_string(),
            "-hls_segment_filename".to_string(),
            segment_filename_pattern(playlist_path),
        ]);
    }

    Ok(EncodeParams {
        initial,
        additional,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::records::ClipTarget;
    use proptest::prelude::*;

    fn option_strategy() -> impl Strategy<Value = ProfileOption> {
        ("-[a-z:]{1,12}", "[a-zA-Z0-9+_]{1,10}").prop_map(|(k, v)| ProfileOption::new(k, v))
    }

    fn profile_strategy() -> impl Strategy<Value = Profile> {
        (
            prop::collection::vec(option_strategy(), 0..6),
            prop::collection::vec(option_strategy(), 0..6),
        )
            .prop_map(|(options, additional_parameters)| Profile {
                id: "p".to_string(),
                encoder: "libx264".to_string(),
                options,
                additional_parameters,
                fallback_id: None,
            })
    }

    const CLIP: ClipWindow = ClipWindow {
        start_secs: 65.5,
        duration_secs: 30.0,
    };

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(200))]

        // Property: the profile-derived portion is the option pairs,
        // flattened in order, so its length is always even.
        #[test]
        fn prop_profile_portion_preserves_pairs(profile in profile_strategy()) {
            let params = build_params(&profile, ModeFlags::default(), None, "out.mp4").unwrap();

            prop_assert_eq!(params.initial.len() % 2, 0);
            prop_assert_eq!(params.additional.len() % 2, 0);
            for (pair, option) in params.initial.chunks(2).zip(&profile.options) {
                prop_assert_eq!(&pair[0], &option.key);
                prop_assert_eq!(&pair[1], &option.value);
            }
            for (pair, option) in params.additional.chunks(2).zip(&profile.additional_parameters) {
                prop_assert_eq!(&pair[0], &option.key);
                prop_assert_eq!(&pair[1], &option.value);
            }
        }

        // Property: mode flags only append; preview adds one pair to each
        // list, segmented streaming adds the fixed segment arguments.
        #[test]
        fn prop_mode_flags_append_fixed_entries(
            profile in profile_strategy(),
            preview in proptest::bool::ANY,
            hls in proptest::bool::ANY,
        ) {
            let base = build_params(&profile, ModeFlags::default(), None, "x/out.m3u8").unwrap();
            let params = build_params(&profile, ModeFlags::new(preview, hls), Some(&CLIP), "x/out.m3u8").unwrap();

            let preview_extra = if preview { 2 } else { 0 };
            let hls_extra = if hls { 6 } else { 0 };
            prop_assert_eq!(params.initial.len(), base.initial.len() + preview_extra);
            prop_assert_eq!(params.additional.len(), base.additional.len() + preview_extra + hls_extra);
            prop_assert_eq!(&params.initial[..base.initial.len()], &base.initial[..]);
            prop_assert_eq!(&params.additional[..base.additional.len()], &base.additional[..]);
        }

        #[test]
        fn prop_params_are_pure(
            profile in profile_strategy(),
            preview in proptest::bool::ANY,
            hls in proptest::bool::ANY,
        ) {
            let mode = ModeFlags::new(preview, hls);
            prop_assert_eq!(
                build_params(&profile, mode, Some(&CLIP), "a/b.m3u8").unwrap(),
                build_params(&profile, mode, Some(&CLIP), "a/b.m3u8").unwrap()
            );
        }
    }

    #[test]
    fn test_preview_appends_start_and_duration() {
        let profile = Profile {
            id: "p".to_string(),
            encoder: "libx264".to_string(),
            options: vec![ProfileOption::new("-hwaccel", "auto")],
            additional_parameters: vec![ProfileOption::new("-preset", "fast")],
            fallback_id: None,
        };

        let params = build_params(&profile, ModeFlags::new(true, false), Some(&CLIP), "o.mp4").unwrap();

        assert_eq!(params.initial, vec!["-hwaccel", "auto", "-ss", "00:01:05.50"]);
        assert_eq!(params.additional, vec!["-preset", "fast", "-t", "00:00:30.00"]);
    }

    #[test]
    fn test_segmented_appends_hls_arguments() {
        let profile = Profile {
            id: "p".to_string(),
            encoder: "libx264".to_string(),
            options: vec![],
            additional_parameters: vec![],
            fallback_id: None,
        };

        let params = build_params(
            &profile,
            ModeFlags::new(false, true),
            None,
            "/srv/converted/clip1/clip1_2024_720p_mp4.m3u8",
        )
        .unwrap();

        assert!(params.initial.is_empty());
        assert_eq!(
            params.additional,
            vec![
                "-hls_time",
                "4",
                "-hls_playlist_type",
                "vod",
                "-hls_segment_filename",
                "/srv/converted/clip1/clip1_2024_720p_mp4_%03d.ts",
            ]
        );
    }

    #[test]
    fn test_preview_without_clip_is_rejected() {
        let profile = Profile {
            id: "p".to_string(),
            encoder: "libx264".to_string(),
            options: vec![],
            additional_parameters: vec![],
            fallback_id: None,
        };
        assert_eq!(
            build_params(&profile, ModeFlags::new(true, false), None, "o.mp4"),
            Err(ParamsError::MissingClip("window"))
        );
    }

    #[test]
    fn test_clip_window_from_payload() {
        let payload = DownloadPayload {
            target: Some(ClipTarget {
                start: Some(12.0),
                duration: Some(8.25),
            }),
        };
        assert_eq!(
            ClipWindow::from_payload(&payload).unwrap(),
            ClipWindow {
                start_secs: 12.0,
                duration_secs: 8.25
            }
        );

        let partial = DownloadPayload {
            target: Some(ClipTarget {
                start: Some(12.0),
                duration: None,
            }),
        };
        assert_eq!(
            ClipWindow::from_payload(&partial),
            Err(ParamsError::MissingClip("duration"))
        );
        assert_eq!(
            ClipWindow::from_payload(&DownloadPayload::default()),
            Err(ParamsError::MissingClip("window"))
        );
    }

    #[test]
    fn test_timecode_formatting() {
        assert_eq!(Timecode::from_seconds(0.0).to_string(), "00:00:00.00");
        assert_eq!(Timecode::from_seconds(65.5).to_string(), "00:01:05.50");
        assert_eq!(Timecode::from_seconds(3725.25).to_string(), "01:02:05.25");
        assert_eq!(Timecode::from_seconds(59.999).to_string(), "00:01:00.00");
        assert_eq!(Timecode::from_seconds(-3.0).to_string(), "00:00:00.00");
    }

    #[test]
    fn test_segment_pattern_without_playlist_extension() {
        assert_eq!(segment_filename_pattern("a/b.m3u8"), "a/b_%03d.ts");
        assert_eq!(segment_filename_pattern("a/b"), "a/b_%03d.ts");
    }
}
