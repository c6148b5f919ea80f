//! Review media sizing

use tracing::debug;

/// Upload field for movies the tracking service transcodes itself
pub const SERVER_TRANSCODE_FIELD: &str = "sg_uploaded_movie";

/// Upload field for pre-transcoded review movies
pub const DIRECT_MOVIE_FIELD: &str = "sg_uploaded_movie_mp4";

/// Scale `width` x `height` down towards `target_height`.
///
/// The result has a height as close to the target as possible but not lower,
/// with both dimensions even and the aspect ratio exact. When no such size
/// exists below the source height, or the target is taller than the source,
/// the original resolution is returned.
pub fn scale_to_height(target_height: u32, width: u32, height: u32) -> (u32, u32) {
    debug!(target_height, width, height, "Finding scaled resolution");

    if height == 0 || target_height > height {
        return (width, height);
    }

    let (w, h) = (u64::from(width), u64::from(height));
    let mut new_height = u64::from(target_height);
    while new_height < h {
        if new_height % 2 == 0 && (new_height * w) % h == 0 {
            let new_width = new_height * w / h;
            if new_width % 2 == 0 {
                // both bounded by the source dimensions
                return (new_width as u32, new_height as u32);
            }
        }
        new_height += 1;
    }

    (width, height)
}

/// Field a review movie is uploaded to.
///
/// Movies are only uploaded as ready-to-play when transcoding is bypassed and
/// the scaled movie really has the review height; anything else goes through
/// server-side transcoding.
pub fn upload_field(bypass_transcoding: bool, scaled_height: u32, review_height: u32) -> &'static str {
    if bypass_transcoding && scaled_height == review_height {
        DIRECT_MOVIE_FIELD
    } else {
        SERVER_TRANSCODE_FIELD
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_hd_scales_to_720() {
        assert_eq!(scale_to_height(720, 1920, 1080), (1280, 720));
    }

    #[test]
    fn test_thumbnail_height_rounds_up() {
        // 16:9 needs a height divisible by 18
        assert_eq!(scale_to_height(400, 1920, 1080), (736, 414));
    }

    #[test]
    fn test_small_source_is_untouched() {
        assert_eq!(scale_to_height(720, 640, 480), (640, 480));
    }

    #[test]
    fn test_awkward_ratio_falls_back_to_source() {
        assert_eq!(scale_to_height(720, 1999, 1001), (1999, 1001));
    }

    #[test]
    fn test_upload_field_selection() {
        assert_eq!(upload_field(true, 720, 720), DIRECT_MOVIE_FIELD);
        assert_eq!(upload_field(true, 480, 720), SERVER_TRANSCODE_FIELD);
        assert_eq!(upload_field(false, 720, 720), SERVER_TRANSCODE_FIELD);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        #[test]
        fn prop_scaled_size_is_even_and_keeps_ratio(
            target in 100u32..1200,
            width in 2u32..4096,
            height in 2u32..2160,
        ) {
            let (w, h) = scale_to_height(target, width, height);
            if (w, h) != (width, height) {
                prop_assert!(h >= target);
                prop_assert!(h < height);
                prop_assert_eq!(w % 2, 0);
                prop_assert_eq!(h % 2, 0);
                prop_assert_eq!(u64::from(w) * u64::from(height), u64::from(h) * u64::from(width));
            }
        }
    }
}
