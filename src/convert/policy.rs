use crate::assets::{DOWNSCALE_HEIGHT, DOWNSCALE_MIN_HEIGHT, DOWNSCALE_MIN_WIDTH, DOWNSCALE_WIDTH};
use serde::{Deserialize, Serialize};

/// Decides the output size of each stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum DownscalePolicy {
    /// Always convert at native resolution
    Disabled,
    /// Sources at least `min_width` x `min_height` are converted to `width` x `height`
    Cap {
        min_width: usize,
        min_height: usize,
        width: usize,
        height: usize,
        /// Fit inside `width` x `height` instead of stretching to it
        #[serde(default)]
        preserve_aspect: bool,
    },
}

impl Default for DownscalePolicy {
    fn default() -> Self {
        DownscalePolicy::Cap {
            min_width: DOWNSCALE_MIN_WIDTH,
            min_height: DOWNSCALE_MIN_HEIGHT,
            width: DOWNSCALE_WIDTH,
            height: DOWNSCALE_HEIGHT,
            preserve_aspect: false,
        }
    }
}

impl DownscalePolicy {
    /// Output dimensions for a `width` x `height` source
    pub fn target(&self, width: usize, height: usize) -> (usize, usize) {
        match *self {
            DownscalePolicy::Disabled => (width, height),
            DownscalePolicy::Cap {
                min_width,
                min_height,
                width: cap_w,
                height: cap_h,
                preserve_aspect,
            } => {
                if width < min_width || height < min_height {
                    return (width, height);
                }
                if !preserve_aspect {
                    return (cap_w, cap_h);
                }
                fit(width, height, cap_w, cap_h)
            }
        }
    }

    pub fn validate(&self) -> Result<(), String> {
        match *self {
            DownscalePolicy::Disabled => Ok(()),
            DownscalePolicy::Cap { width, height, .. } if width == 0 || height == 0 => {
                Err("downscale target must be at least 1x1".into())
            }
            DownscalePolicy::Cap {
                min_width,
                min_height,
                ..
            } if min_width == 0 || min_height == 0 => {
                Err("downscale threshold must be at least 1x1".into())
            }
            DownscalePolicy::Cap { .. } => Ok(()),
        }
    }
}

/// Largest even size inside `max_w` x `max_h` with the source aspect ratio
fn fit(width: usize, height: usize, max_w: usize, max_h: usize) -> (usize, usize) {
    if width == 0 || height == 0 {
        return (width, height);
    }
    let (w, h) = if max_w * height <= max_h * width {
        (max_w, height * max_w / width)
    } else {
        (width * max_h / height, max_h)
    };
    let even = |v: usize| (v & !1).max(2);
    (even(w), even(h))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_large_sources_are_capped() {
        let policy = DownscalePolicy::default();
        assert_eq!(policy.target(1920, 1080), (640, 480));
        assert_eq!(policy.target(1280, 720), (640, 480));
        assert_eq!(policy.target(3840, 2160), (640, 480));
    }

    #[test]
    fn test_small_sources_keep_native_size() {
        let policy = DownscalePolicy::default();
        assert_eq!(policy.target(1279, 720), (1279, 720));
        assert_eq!(policy.target(704, 576), (704, 576));
        // only one side over the threshold
        assert_eq!(policy.target(1920, 600), (1920, 600));
    }

    #[test]
    fn test_disabled_never_scales() {
        assert_eq!(DownscalePolicy::Disabled.target(3840, 2160), (3840, 2160));
    }

    #[test]
    fn test_preserve_aspect_fits_inside_cap() {
        let policy = DownscalePolicy::Cap {
            min_width: 1280,
            min_height: 720,
            width: 640,
            height: 480,
            preserve_aspect: true,
        };
        assert_eq!(policy.target(1920, 1080), (640, 360));
        assert_eq!(policy.target(1440, 1080), (640, 480));
    }

    #[test]
    fn test_zero_threshold_is_rejected() {
        let policy = DownscalePolicy::Cap {
            min_width: 0,
            min_height: 720,
            width: 640,
            height: 480,
            preserve_aspect: true,
        };
        assert!(policy.validate().is_err());
        assert!(DownscalePolicy::default().validate().is_ok());
        // an empty frame never divides by zero
        assert_eq!(policy.target(0, 720), (0, 720));
    }

    #[test]
    fn test_policy_from_json() {
        let policy: DownscalePolicy = serde_json::from_str(r#"{"mode":"disabled"}"#).unwrap();
        assert_eq!(policy, DownscalePolicy::Disabled);

        let policy: DownscalePolicy = serde_json::from_str(
            r#"{"mode":"cap","min_width":1920,"min_height":1080,"width":960,"height":540}"#,
        )
        .unwrap();
        assert_eq!(policy.target(1920, 1080), (960, 540));
        assert!(policy.validate().is_ok());
    }
}
