//! Just enough HLS text handling to tell real manifests from placeholders and
//! to write playlists. No full parser.

use crate::profile::Profile;

/// A manifest of at most this many bytes (trimmed) is a placeholder.
const STUB_MAX_LEN: usize = 8;

/// Placeholder manifests are left behind by aborted encodes; they must never
/// count as a finished rendition.
pub fn is_stub_manifest(text: &str) -> bool {
    let trimmed = text.trim();
    trimmed.len() <= STUB_MAX_LEN || !trimmed.to_ascii_lowercase().contains("#extinf")
}

/// A finished VOD playlist: not a placeholder and closed with
/// `#EXT-X-ENDLIST`. ffmpeg rewrites its playlist while it runs, so a crashed
/// encode leaves segments listed without the end marker.
pub fn is_complete_manifest(text: &str) -> bool {
    !is_stub_manifest(text)
        && text
            .lines()
            .any(|line| line.trim().eq_ignore_ascii_case("#EXT-X-ENDLIST"))
}

/// Segment file names referenced by a media playlist, in playlist order.
pub fn segment_references(manifest: &str) -> Vec<String> {
    manifest
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .filter_map(|uri| {
            let without_query = uri.split(['?', '#']).next().unwrap_or(uri);
            without_query
                .rsplit('/')
                .next()
                .filter(|name| !name.is_empty())
                .map(str::to_string)
        })
        .collect()
}

/// A segment name is acceptable only as a bare file name.
pub fn is_plain_segment_name(name: &str) -> bool {
    !name.is_empty()
        && name != "."
        && name != ".."
        && !name.contains(['/', '\\', '\0'])
}

pub fn render_media_playlist(segments: &[(f64, &str)]) -> String {
    let mut playlist = String::new();
    playlist.push_str("#EXTM3U\n");
    playlist.push_str("#EXT-X-VERSION:3\n");
    let target = segments
        .iter()
        .map(|(duration, _)| duration.ceil() as u32)
        .max()
        .unwrap_or(4);
    playlist.push_str(&format!("#EXT-X-TARGETDURATION:{target}\n"));
    playlist.push_str("#EXT-X-MEDIA-SEQUENCE:0\n");
    playlist.push_str("#EXT-X-PLAYLIST-TYPE:VOD\n");
    for (duration, name) in segments {
        playlist.push_str(&format!("#EXTINF:{duration:.6},\n{name}\n"));
    }
    playlist.push_str("#EXT-X-ENDLIST\n");
    playlist
}

/// `profiles` must already be in the order they should be listed.
pub fn render_master_playlist(profiles: &[&Profile]) -> String {
    let mut playlist = String::from("#EXTM3U\n");
    for profile in profiles {
        playlist.push_str(&format!(
            "#EXT-X-STREAM-INF:BANDWIDTH={},RESOLUTION={}\n{}/index.m3u8\n",
            profile.bandwidth,
            profile.dimensions(),
            profile.label
        ));
    }
    playlist
}
