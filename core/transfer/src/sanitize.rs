//! Filesystem-safe file names.

/// Characters rejected by common filesystems.
const ILLEGAL: &[char] = &['<', '>', ':', '"', '/', '\\', '|', '?', '*'];

/// Longest file name accepted by common filesystems, in bytes.
pub const MAX_FILENAME_BYTES: usize = 255;

const PLACEHOLDER: char = '_';

/// Make a remote file name safe to create locally.
///
/// Illegal and ASCII control characters become `_`, empty, `.` and `..`
/// become `_`, and names longer than [`MAX_FILENAME_BYTES`] are shortened
/// while keeping the extension and whole UTF-8 characters.
pub fn sanitize_filename(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .map(|c| {
            if ILLEGAL.contains(&c) || c.is_ascii_control() {
                PLACEHOLDER
            } else {
                c
            }
        })
        .collect();

    if cleaned.is_empty() || cleaned == "." || cleaned == ".." {
        return PLACEHOLDER.to_string();
    }
    truncate(cleaned)
}

fn truncate(name: String) -> String {
    if name.len() <= MAX_FILENAME_BYTES {
        return name;
    }

    let (stem, extension) = match name.rfind('.') {
        Some(dot) if dot > 0 => name.split_at(dot),
        _ => (name.as_str(), ""),
    };
    if extension.len() >= MAX_FILENAME_BYTES {
        return floor_at_char(&name, MAX_FILENAME_BYTES).to_string();
    }

    let stem = floor_at_char(stem, MAX_FILENAME_BYTES - extension.len());
    format!("{}{}", stem, extension)
}

/// Longest prefix of `s` that fits in `max` bytes without splitting a character.
fn floor_at_char(s: &str, max: usize) -> &str {
    let mut end = max.min(s.len());
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_replaces_illegal_characters() {
        assert_eq!(sanitize_filename("a<b>c:d\"e.png"), "a_b_c_d_e.png");
        assert_eq!(sanitize_filename("dir/sub\\x|y?z*.jpg"), "dir_sub_x_y_z_.jpg");
        assert_eq!(sanitize_filename("tab\there.gif"), "tab_here.gif");
        assert_eq!(sanitize_filename("plain.webp"), "plain.webp");
    }

    #[test]
    fn test_degenerate_names() {
        assert_eq!(sanitize_filename(""), "_");
        assert_eq!(sanitize_filename("."), "_");
        assert_eq!(sanitize_filename(".."), "_");
        assert_eq!(sanitize_filename("/"), "_");
    }

    #[test]
    fn test_truncates_keeping_extension() {
        let long = format!("{}.jpeg", "x".repeat(300));
        let sanitized = sanitize_filename(&long);
        assert_eq!(sanitized.len(), MAX_FILENAME_BYTES);
        assert!(sanitized.ends_with(".jpeg"));
    }

    #[test]
    fn test_truncation_respects_char_boundaries() {
        let long = format!("{}.png", "é".repeat(200));
        let sanitized = sanitize_filename(&long);
        assert!(sanitized.len() <= MAX_FILENAME_BYTES);
        assert!(sanitized.ends_with(".png"));
        assert!(sanitized.trim_end_matches(".png").chars().all(|c| c == 'é'));
    }

    proptest! {
        #[test]
        fn prop_no_illegal_characters_remain(
            stem in "[a-zA-Z0-9<>:\"/\\\\|?* \\x00-\\x1f]{1,40}",
            ext in "[a-z]{1,5}",
        ) {
            let name = format!("{}.{}", stem, ext);
            let sanitized = sanitize_filename(&name);
            prop_assert!(!sanitized.chars().any(|c| ILLEGAL.contains(&c) || c.is_ascii_control()));
            let expected_ext = format!(".{}", ext);
            prop_assert!(sanitized.ends_with(&expected_ext));
        }

        #[test]
        fn prop_long_names_are_capped(
            stem in "\\PC{200,400}",
            ext in "[a-z0-9]{1,8}",
        ) {
            let name = format!("{}.{}", stem, ext);
            let sanitized = sanitize_filename(&name);
            prop_assert!(sanitized.len() <= MAX_FILENAME_BYTES);
            let expected_ext = format!(".{}", ext);
            prop_assert!(sanitized.ends_with(&expected_ext));
        }

        #[test]
        fn prop_is_idempotent(name in "\\PC{0,300}") {
            let once = sanitize_filename(&name);
            prop_assert_eq!(sanitize_filename(&once), once);
        }
    }
}
