//! Encode profiles and the encoder fallback policy.
//!
//! A profile names an encoder and carries ordered option pairs. The first
//! attempt of a job always uses the owner's primary profile; every later
//! attempt uses the single fallback profile the primary designates. There is
//! no fallback of a fallback.

use crate::records::StoreError;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

/// Errors raised while selecting the profile for an attempt.
#[derive(Debug, Error)]
pub enum FallbackError {
    /// Attempts are counted from 1.
    #[error("Invalid attempt number 0")]
    InvalidAttempt,

    /// A retry was requested but the primary profile has no fallback.
    #[error("Profile {profile} ({encoder}) has no fallback profile for attempt {attempt}")]
    NoFallback {
        profile: String,
        encoder: String,
        attempt: u32,
    },

    /// The designated fallback profile does not exist.
    #[error("Fallback profile {fallback} of profile {profile} does not exist")]
    UnknownFallback { profile: String, fallback: String },

    /// The profile lookup itself failed.
    #[error("Profile lookup failed: {0}")]
    Lookup(#[source] StoreError),
}

/// One option pair, flattened to `key value` on the command line.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProfileOption {
    pub key: String,
    pub value: String,
}

impl ProfileOption {
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }
}

/// Encode configuration owned by a user.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Profile {
    pub id: String,
    /// Video encoder name, e.g. `libx264`, `h264_vaapi`, `h264_nvenc`.
    pub encoder: String,
    /// Options placed before the input.
    #[serde(default)]
    pub options: Vec<ProfileOption>,
    /// Options placed after the input.
    #[serde(default)]
    pub additional_parameters: Vec<ProfileOption>,
    #[serde(default)]
    pub fallback_id: Option<String>,
}

/// Select the profile to use for the given attempt.
///
/// `lookup` resolves a profile id; it is only called for attempts after the
/// first. A lookup that reports the fallback as missing is a configuration
/// error, the same as a primary without any fallback reference.
pub fn select_profile<F>(
    attempt: u32,
    primary: Profile,
    lookup: F,
) -> Result<Profile, FallbackError>
where
    F: FnOnce(&str) -> Result<Profile, StoreError>,
{
    match attempt {
        0 => Err(FallbackError::InvalidAttempt),
        1 => Ok(primary),
        _ => {
            info!(
                attempt,
                "Previous attempt with profile {} failed using encoder {}",
                primary.id,
                primary.encoder
            );

            let fallback_id = primary
                .fallback_id
                .as_deref()
                .ok_or_else(|| FallbackError::NoFallback {
                    profile: primary.id.clone(),
                    encoder: primary.encoder.clone(),
                    attempt,
                })?;

            lookup(fallback_id).map_err(|e| {
                if e.is_not_found() {
                    FallbackError::UnknownFallback {
                        profile: primary.id.clone(),
                        fallback: fallback_id.to_string(),
                    }
                } else {
                    FallbackError::Lookup(e)
                }
            })
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use proptest::prelude::*;

    pub(crate) fn make_profile(id: &str, encoder: &str, fallback: Option<&str>) -> Profile {
        Profile {
            id: id.to_string(),
            encoder: encoder.to_string(),
            options: vec![ProfileOption::new("-hwaccel", "vaapi")],
            additional_parameters: vec![
                ProfileOption::new("-preset", "fast"),
                ProfileOption::new("-movflags", "+faststart"),
            ],
            fallback_id: fallback.map(str::to_string),
        }
    }

    fn lookup_software(id: &str) -> Result<Profile, StoreError> {
        if id == "software" {
            Ok(make_profile("software", "libx264", None))
        } else {
            Err(StoreError::NotFound {
                kind: "profile",
                id: id.to_string(),
            })
        }
    }

    // Property: attempt 1 selects the primary; any later attempt selects
    // exactly the designated fallback.
    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        #[test]
        fn prop_attempt_selects_primary_or_fallback(attempt in 1u32..1000) {
            let primary = make_profile("gpu", "h264_vaapi", Some("software"));
            let selected = select_profile(attempt, primary.clone(), lookup_software).unwrap();

            if attempt == 1 {
                prop_assert_eq!(selected, primary);
            } else {
                prop_assert_eq!(selected.id.as_str(), "software");
                prop_assert_eq!(selected.encoder.as_str(), "libx264");
            }
        }

        #[test]
        fn prop_retry_without_fallback_is_fatal(attempt in 2u32..1000) {
            let primary = make_profile("gpu", "h264_nvenc", None);
            let err = select_profile(attempt, primary, lookup_software).unwrap_err();
            let is_no_fallback = matches!(err, FallbackError::NoFallback { .. });
            prop_assert!(is_no_fallback);
        }
    }

    #[test]
    fn test_first_attempt_never_consults_lookup() {
        let primary = make_profile("gpu", "h264_vaapi", None);
        let selected = select_profile(1, primary.clone(), |_| -> Result<Profile, StoreError> {
            panic!("lookup must not run on the first attempt")
        })
        .unwrap();
        assert_eq!(selected, primary);
    }

    #[test]
    fn test_attempt_zero_is_rejected() {
        let primary = make_profile("gpu", "h264_vaapi", Some("software"));
        assert!(matches!(
            select_profile(0, primary, lookup_software),
            Err(FallbackError::InvalidAttempt)
        ));
    }

    #[test]
    fn test_dangling_fallback_is_a_configuration_error() {
        let primary = make_profile("gpu", "h264_vaapi", Some("deleted"));
        let err = select_profile(2, primary, lookup_software).unwrap_err();
        assert!(matches!(err, FallbackError::UnknownFallback { ref fallback, .. } if fallback == "deleted"));
    }

    #[test]
    fn test_lookup_io_failure_is_propagated() {
        let primary = make_profile("gpu", "h264_vaapi", Some("software"));
        let err = select_profile(2, primary, |_| {
            Err(StoreError::Io(std::io::Error::new(
                std::io::ErrorKind::PermissionDenied,
                "denied",
            )))
        })
        .unwrap_err();
        assert!(matches!(err, FallbackError::Lookup(_)));
    }

    #[test]
    fn test_fallback_is_not_chained() {
        // The fallback's own fallback is never followed, whatever the attempt.
        let primary = make_profile("gpu", "h264_vaapi", Some("middle"));
        let selected = select_profile(5, primary, |id| {
            assert_eq!(id, "middle");
            Ok(make_profile("middle", "h264_nvenc", Some("software")))
        })
        .unwrap();
        assert_eq!(selected.id, "middle");
    }
}
