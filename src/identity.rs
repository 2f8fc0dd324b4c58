//! Object key → `(stream, frame)` resolution.
//!
//! Canonical frame names look like `<stream digits>_<anything>_<frame
//! digits>_<anything>.<ext>`. Any other key resolves through the fallback:
//! the key's directory is the stream and the extension-less file name is the
//! frame. Resolution never fails.

use std::sync::OnceLock;

use percent_encoding::percent_decode_str;
use regex::Regex;
use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Resolution {
    Canonical,
    Fallback,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrameIdentity {
    pub stream_id: String,
    pub frame_id: String,
    pub resolution: Resolution,
}

impl FrameIdentity {
    pub fn as_pair(&self) -> (&str, &str) {
        (&self.stream_id, &self.frame_id)
    }
}

fn canonical_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^(\d+)_.*?_(\d+)_").expect("static frame-name pattern"))
}

pub fn resolve(object_key: &str) -> FrameIdentity {
    let (directory, file_name) = split_key(object_key);
    let frame_name = strip_extension(file_name);

    if let Some(caps) = canonical_pattern().captures(frame_name) {
        return FrameIdentity {
            stream_id: caps[1].to_string(),
            frame_id: caps[2].to_string(),
            resolution: Resolution::Canonical,
        };
    }

    log::debug!("identity: {} is not canonical, using fallback", object_key);
    FrameIdentity {
        stream_id: directory.to_string(),
        frame_id: frame_name.to_string(),
        resolution: Resolution::Fallback,
    }
}

/// `name` without its final `.ext`. Leading dots belong to the name, so
/// `.mjpeg` has no extension.
pub fn strip_extension(name: &str) -> &str {
    let leading_dots = name.len() - name.trim_start_matches('.').len();
    match name[leading_dots..].rfind('.') {
        Some(dot) => &name[..leading_dots + dot],
        None => name,
    }
}

/// Split into (directory, file name). The directory keeps a lone leading
/// `/` but drops trailing separators.
fn split_key(key: &str) -> (&str, &str) {
    match key.rsplit_once('/') {
        Some((dir, file)) => {
            let trimmed = dir.trim_end_matches('/');
            if trimmed.is_empty() {
                // Only separators before the file name: the root.
                (&key[..1], file)
            } else {
                (trimmed, file)
            }
        }
        None => ("", key),
    }
}

/// Decode an object key as delivered in storage-event notifications:
/// `+` is a space and `%XX` is a percent-encoded byte. Malformed escapes are
/// kept verbatim.
pub fn decode_object_key(raw: &str) -> String {
    percent_decode_str(&raw.replace('+', " "))
        .decode_utf8_lossy()
        .into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canonical_name_yields_both_digit_runs() {
        let id = resolve("123_stream_456_abc.jpg");
        assert_eq!(id.as_pair(), ("123", "456"));
        assert_eq!(id.resolution, Resolution::Canonical);
    }

    #[test]
    fn canonical_match_ignores_directories() {
        let id = resolve("uploads/cam-a/0042_front door_0007_1700000000.jpeg");
        assert_eq!(id.as_pair(), ("0042", "0007"));
    }

    #[test]
    fn non_matching_key_falls_back_to_directory() {
        let id = resolve("dirA/unparsable.jpg");
        assert_eq!(id.as_pair(), ("dirA", "unparsable"));
        assert_eq!(id.resolution, Resolution::Fallback);
    }

    #[test]
    fn keyframe_keys_resolve_to_video_and_frame() {
        assert_eq!(
            resolve("lobby/frame_0012.jpg").as_pair(),
            ("lobby", "frame_0012")
        );
    }

    #[test]
    fn fallback_without_directory_has_empty_stream() {
        assert_eq!(resolve("test.jpg").as_pair(), ("", "test"));
        assert_eq!(resolve("noext").as_pair(), ("", "noext"));
        assert_eq!(resolve("/root.png").as_pair(), ("/", "root"));
        assert_eq!(resolve("a/b//c.tar.gz").as_pair(), ("a/b", "c.tar"));
    }

    #[test]
    fn leading_dot_is_part_of_the_name() {
        assert_eq!(strip_extension(".mjpeg"), ".mjpeg");
        assert_eq!(strip_extension("..hidden"), "..hidden");
        assert_eq!(strip_extension(".clip.mjpeg"), ".clip");
        assert_eq!(strip_extension("clip."), "clip");
        assert_eq!(resolve("cams/.config").as_pair(), ("cams", ".config"));
    }

    #[test]
    fn digits_need_trailing_separator() {
        // No underscore after the second digit run.
        let id = resolve("12_cam_34.jpg");
        assert_eq!(id.resolution, Resolution::Fallback);
        assert_eq!(id.as_pair(), ("", "12_cam_34"));
    }

    #[test]
    fn decodes_notification_keys() {
        assert_eq!(decode_object_key("my+video%2B1.mp4"), "my video+1.mp4");
        assert_eq!(decode_object_key("a%2Fb%zz%4"), "a/b%zz%4");
        assert_eq!(decode_object_key("caf%C3%A9.jpg"), "café.jpg");
    }
}
