//! Pure policy for turning a format catalog plus a download request into a
//! single selection and a `yt-dlp` `-f` selector string. No I/O.

use serde::{Deserialize, Serialize};

use crate::models::{FormatDescriptor, RequestKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Preset {
    Best,
    Good,
    Normal,
    Bad,
    Worst,
}

struct Limits {
    max_height: Option<u32>,
    max_tbr: Option<f64>,
}

fn limits_for(preset: Preset) -> Limits {
    match preset {
        Preset::Best => Limits {
            max_height: None,
            max_tbr: None,
        },
        Preset::Good => Limits {
            max_height: Some(1080),
            max_tbr: Some(256.0),
        },
        Preset::Normal => Limits {
            max_height: Some(720),
            max_tbr: Some(192.0),
        },
        Preset::Bad => Limits {
            max_height: Some(480),
            max_tbr: Some(128.0),
        },
        Preset::Worst => Limits {
            max_height: Some(360),
            max_tbr: Some(96.0),
        },
    }
}

/// Splits a selector on top-level `/` alternatives, returning the first
/// `+`-component of each alternative (the id `resolve` actually matches).
fn selector_candidate_ids(selector: &str) -> Vec<&str> {
    selector
        .split('/')
        .map(|alt| alt.split('+').next().unwrap_or(alt).trim())
        .filter(|s| !s.is_empty())
        .collect()
}

/// Resolves a catalog + request + preset to a single descriptor, per the
/// three-rule policy: explicit selector match, then video/audio ranking.
pub fn resolve<'a>(
    formats: &'a [FormatDescriptor],
    kind: RequestKind,
    explicit_selector: Option<&str>,
    preset: Preset,
) -> Option<&'a FormatDescriptor> {
    if let Some(selector) = explicit_selector {
        for candidate in selector_candidate_ids(selector) {
            if let Some(found) = formats.iter().find(|f| f.id == candidate) {
                return Some(found);
            }
        }
    }

    let limits = limits_for(preset);

    match kind {
        RequestKind::Video => {
            let mut candidates: Vec<&FormatDescriptor> =
                formats.iter().filter(|f| f.has_video()).collect();
            candidates.sort_by(|a, b| {
                let ha = a.height.unwrap_or(0);
                let hb = b.height.unwrap_or(0);
                let fa = a.fps.unwrap_or(0.0);
                let fb = b.fps.unwrap_or(0.0);
                let ta = a.tbr.unwrap_or(0.0);
                let tb = b.tbr.unwrap_or(0.0);
                hb.cmp(&ha)
                    .then(fb.partial_cmp(&fa).unwrap_or(std::cmp::Ordering::Equal))
                    .then(tb.partial_cmp(&ta).unwrap_or(std::cmp::Ordering::Equal))
            });

            if preset == Preset::Worst {
                return candidates.last().copied();
            }

            if let Some(max_h) = limits.max_height {
                if let Some(found) = candidates.iter().find(|f| f.height.unwrap_or(0) <= max_h) {
                    return Some(*found);
                }
            }
            candidates.first().copied()
        }
        RequestKind::Audio => {
            let mut candidates: Vec<&FormatDescriptor> = formats
                .iter()
                .filter(|f| f.has_audio() && !f.has_video())
                .collect();
            candidates.sort_by(|a, b| {
                let ta = a.tbr.unwrap_or(0.0);
                let tb = b.tbr.unwrap_or(0.0);
                let sa = a.filesize.or(a.filesize_approx).unwrap_or(0);
                let sb = b.filesize.or(b.filesize_approx).unwrap_or(0);
                tb.partial_cmp(&ta)
                    .unwrap_or(std::cmp::Ordering::Equal)
                    .then(sb.cmp(&sa))
            });

            if preset == Preset::Worst {
                return candidates.last().copied();
            }

            if let Some(max_tbr) = limits.max_tbr {
                if let Some(found) = candidates.iter().find(|f| f.tbr.unwrap_or(0.0) <= max_tbr) {
                    return Some(*found);
                }
            }
            candidates.first().copied()
        }
    }
}

fn same_container_audio_ext(video_ext: &str) -> Option<&'static str> {
    match video_ext {
        "mp4" | "m4v" => Some("m4a"),
        "webm" => Some("webm"),
        _ => None,
    }
}

/// Builds the `-f` selector string for a resolved video format.
pub fn video_selector(descriptor: &FormatDescriptor) -> String {
    if descriptor.is_muxed() {
        return descriptor.id.clone();
    }

    let preferred_audio = same_container_audio_ext(&descriptor.ext);
    match preferred_audio {
        Some(ext) => format!(
            "{id}+bestaudio[ext={ext}]/{id}+bestaudio",
            id = descriptor.id,
            ext = ext
        ),
        None => format!("{id}+bestaudio", id = descriptor.id),
    }
}

/// Builds the `-f` selector string for a resolved audio format, or for an
/// explicit audio selector passed straight through by the caller.
pub fn audio_selector(descriptor: Option<&FormatDescriptor>, explicit: Option<&str>) -> String {
    if let Some(sel) = explicit {
        if !sel.is_empty() {
            return sel.to_string();
        }
    }
    match descriptor {
        Some(d) => d.id.clone(),
        None => "bestaudio".to_string(),
    }
}

/// Parses a progress-line byte-size token like `12.3MiB` or `~4KB`.
/// Units ending in `i` (`KiB`, `MiB`, `GiB`, `TiB`) use binary multipliers;
/// plain `KB`/`MB`/`GB`/`TB` use decimal multipliers. Returns `None` on any
/// malformed input.
pub fn parse_byte_size(input: &str) -> Option<u64> {
    let s = input.trim().trim_start_matches('~');
    let split_at = s.find(|c: char| c.is_ascii_alphabetic())?;
    let (number_part, unit_part) = s.split_at(split_at);
    let number: f64 = number_part.parse().ok()?;
    if number < 0.0 {
        return None;
    }

    let multiplier: f64 = match unit_part {
        "B" => 1.0,
        "KB" => 1_000.0,
        "KiB" => 1_024.0,
        "MB" => 1_000_000.0,
        "MiB" => 1_048_576.0,
        "GB" => 1_000_000_000.0,
        "GiB" => 1_073_741_824.0,
        "TB" => 1_000_000_000_000.0,
        "TiB" => 1_099_511_627_776.0,
        _ => return None,
    };

    Some((number * multiplier).round() as u64)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fmt(id: &str, height: Option<u32>, vcodec: &str, acodec: &str, ext: &str) -> FormatDescriptor {
        FormatDescriptor {
            id: id.to_string(),
            ext: ext.to_string(),
            width: None,
            height,
            fps: None,
            vcodec: Some(vcodec.to_string()),
            acodec: Some(acodec.to_string()),
            tbr: None,
            filesize: None,
            filesize_approx: None,
            format_note: None,
            protocol: None,
            video_ext: None,
            audio_ext: None,
            language: None,
        }
    }

    fn audio(id: &str, tbr: f64) -> FormatDescriptor {
        FormatDescriptor {
            id: id.to_string(),
            ext: "m4a".to_string(),
            width: None,
            height: None,
            fps: None,
            vcodec: Some("none".to_string()),
            acodec: Some("mp4a".to_string()),
            tbr: Some(tbr),
            filesize: None,
            filesize_approx: None,
            format_note: None,
            protocol: None,
            video_ext: None,
            audio_ext: None,
            language: None,
        }
    }

    #[test]
    fn best_quality_muxed_catalog_picks_highest() {
        let catalog = vec![
            fmt("22", Some(720), "avc1", "mp4a", "mp4"),
            fmt("18", Some(360), "avc1", "mp4a", "mp4"),
        ];
        let picked = resolve(&catalog, RequestKind::Video, None, Preset::Best).unwrap();
        assert_eq!(picked.id, "22");
        assert_eq!(video_selector(picked), "22");
    }

    #[test]
    fn good_quality_split_catalog_prefers_first_within_limit() {
        let mut catalog = vec![
            fmt("137", Some(1080), "avc1", "none", "mp4"),
            fmt("248", Some(1080), "vp9", "none", "webm"),
        ];
        catalog.push(audio("140", 128.0));
        let picked = resolve(&catalog, RequestKind::Video, None, Preset::Good).unwrap();
        assert_eq!(picked.id, "137");
        assert_eq!(video_selector(picked), "137+bestaudio[ext=m4a]/137+bestaudio");
    }

    #[test]
    fn worst_audio_picks_lowest_bitrate() {
        let catalog = vec![audio("140", 128.0), audio("139", 48.0)];
        let picked = resolve(&catalog, RequestKind::Audio, None, Preset::Worst).unwrap();
        assert_eq!(picked.id, "139");
        assert_eq!(audio_selector(Some(picked), None), "139");
    }

    #[test]
    fn explicit_selector_with_alternatives_matches_first_component() {
        let catalog = vec![fmt("137", Some(1080), "avc1", "none", "mp4")];
        let picked = resolve(
            &catalog,
            RequestKind::Video,
            Some("137+bestaudio/bestvideo"),
            Preset::Best,
        )
        .unwrap();
        assert_eq!(picked.id, "137");
    }

    #[test]
    fn byte_size_parsing_distinguishes_decimal_and_binary() {
        assert_eq!(parse_byte_size("1KB"), Some(1_000));
        assert_eq!(parse_byte_size("1KiB"), Some(1_024));
        assert_eq!(parse_byte_size("~2.5MiB"), Some((2.5 * 1_048_576.0).round() as u64));
        assert_eq!(parse_byte_size("bogus"), None);
        assert_eq!(parse_byte_size("5XB"), None);
    }

    #[test]
    fn resolve_is_pure_and_does_not_mutate_catalog() {
        let catalog = vec![fmt("22", Some(720), "avc1", "mp4a", "mp4")];
        let before = catalog.clone();
        let _ = resolve(&catalog, RequestKind::Video, None, Preset::Best);
        assert_eq!(catalog, before);
    }
}
