//! Path helpers for host frame-sequence paths
//!
//! The host names image sequences with an inclusive frame-range token,
//! e.g. `sh_010.[0265-0324].dpx`. The tracking service expects printf style
//! sequence paths (`sh_010.%04d.dpx`).

use crate::assets::AssetDescriptor;
use crate::collaborators::{FieldValue, Fields};
use crate::error::ExportError;
use chrono::{Datelike, NaiveDateTime, Timelike};
use std::path::Path;

/// Field holding the frame-range token in video templates
pub const SEQ_FIELD: &str = "SEQ";

/// A `[first-last]` token found in a path
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameToken<'a> {
    pub first: &'a str,
    pub last: &'a str,
    /// Byte offsets of `[` and one past `]`
    pub start: usize,
    pub end: usize,
}

impl FrameToken<'_> {
    /// printf style replacement: `%0Nd` for equal 4 to 7 digit padding, `%d` otherwise
    pub fn format_spec(&self) -> String {
        let width = self.first.len();
        if width == self.last.len() && (4..=7).contains(&width) {
            format!("%0{}d", width)
        } else {
            "%d".to_string()
        }
    }

    pub fn range(&self) -> Option<(i64, i64)> {
        Some((self.first.parse().ok()?, self.last.parse().ok()?))
    }
}

/// First frame-range token in `path`
pub fn find_frame_token(path: &str) -> Option<FrameToken<'_>> {
    find_frame_token_from(path, 0)
}

fn find_frame_token_from(path: &str, from: usize) -> Option<FrameToken<'_>> {
    let mut search = from;
    while let Some(rel) = path[search..].find('[') {
        let start = search + rel;
        if let Some(token) = parse_token_at(path, start) {
            return Some(token);
        }
        search = start + 1;
    }
    None
}

fn parse_token_at(path: &str, start: usize) -> Option<FrameToken<'_>> {
    let body_start = start + 1;
    let close = body_start + path[body_start..].find(']')?;
    let (first, last) = path[body_start..close].split_once('-')?;
    let digits = |s: &str| !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit());
    if !digits(first) || !digits(last) {
        return None;
    }
    Some(FrameToken {
        first,
        last,
        start,
        end: close + 1,
    })
}

/// Inclusive first/last frame of the host token in `path`
pub fn frame_range(path: &str) -> Option<(i64, i64)> {
    find_frame_token(path)?.range()
}

/// Frame number of a single-frame render such as `sh_010.0265.dpx`.
///
/// The dot-separated digit run directly before the extension.
pub fn single_frame_number(path: &str) -> Option<i64> {
    let name = Path::new(path).file_name()?.to_str()?;
    let stem = &name[..name.rfind('.')?];
    let (_, digits) = stem.rsplit_once('.')?;
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    digits.parse().ok()
}

/// Replace every frame-range token with its printf equivalent
///
/// `sh_010.[0265-0324].dpx` becomes `sh_010.%04d.dpx`.
pub fn normalize_sequence_path(path: &str) -> String {
    let mut out = String::with_capacity(path.len());
    let mut cursor = 0;
    while let Some(token) = find_frame_token_from(path, cursor) {
        out.push_str(&path[cursor..token.start]);
        out.push_str(&token.format_spec());
        cursor = token.end;
    }
    out.push_str(&path[cursor..]);
    out
}

/// Version name of a rendered path: the file name without frame token and extension
///
/// `/a/b/sh_010.v001.[0001-0010].dpx` gives `sh_010.v001`.
pub fn version_name(path: &str) -> String {
    let stem = Path::new(path)
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    Path::new(&stem)
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or(stem)
}

/// Default location of a locally generated movie: next to the frames
pub fn sibling_movie_path(path: &str) -> String {
    let name = format!("{}.mov", version_name(path));
    match Path::new(path).parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir.join(name).to_string_lossy().into_owned(),
        _ => name,
    }
}

pub fn join_export_path(destination: &str, resolved: &str) -> String {
    if destination.is_empty() {
        return resolved.to_string();
    }
    Path::new(destination)
        .join(resolved)
        .to_string_lossy()
        .into_owned()
}

/// `path` relative to `root`, or unchanged when it lies outside it
pub fn relative_to(path: &str, root: &Path) -> String {
    Path::new(path)
        .strip_prefix(root)
        .map(|p| p.to_string_lossy().into_owned())
        .unwrap_or_else(|_| path.to_string())
}

/// Fill in the fields the host decides at export time.
///
/// Fields already supplied (e.g. by the context) are left untouched. A video
/// asset without a frame-range token in its host path is a configuration
/// error since its template cannot be resolved.
pub fn inject_dynamic_fields(
    fields: &mut Fields,
    asset: &AssetDescriptor,
    now: NaiveDateTime,
) -> Result<(), ExportError> {
    if let AssetDescriptor::Video(video) = asset {
        let token = find_frame_token(&video.resolved_path).ok_or_else(|| {
            ExportError::Configuration(format!(
                "no frame range token found in video path '{}'",
                video.resolved_path
            ))
        })?;
        let token_text = &video.resolved_path[token.start..token.end];
        insert_missing(fields, SEQ_FIELD, token_text.into());
        insert_missing(fields, "width", i64::from(video.width).into());
        insert_missing(fields, "height", i64::from(video.height).into());
        insert_missing(fields, "segment_name", video.segment_name().into());
    }

    insert_missing(fields, "version", asset.version_number().into());
    insert_missing(fields, "YYYY", i64::from(now.year()).into());
    insert_missing(fields, "MM", i64::from(now.month()).into());
    insert_missing(fields, "DD", i64::from(now.day()).into());
    insert_missing(fields, "hh", i64::from(now.hour()).into());
    insert_missing(fields, "mm", i64::from(now.minute()).into());
    insert_missing(fields, "ss", i64::from(now.second()).into());
    Ok(())
}

fn insert_missing(fields: &mut Fields, key: &str, value: FieldValue) {
    fields.entry(key.to_string()).or_insert(value);
}
