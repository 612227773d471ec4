//! Track index - read-only reference data describing the playable library

use std::fs;
use std::path::Path;

use lofty::file::{AudioFile, TaggedFileExt};
use lofty::tag::Accessor;
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

use crate::error::Result;

/// Stable track identifier (derived from the file name)
pub type TrackId = String;

/// File extensions picked up by [`TrackIndex::scan_dir`]
const SUPPORTED_EXTENSIONS: &[&str] = &[
    "mp3", "m4a", "aac", "flac", "ogg", "wav", "opus", "mp4", "m4b",
];

/// A single entry of the track index
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrackEntry {
    pub track_id: TrackId,
    pub file_name: String,
    pub size: u64,
    pub mime: String,
    /// Duration in seconds, 0.0 when unknown
    pub duration: f64,
    pub title: String,
    pub artist: String,
    pub album: String,
}

impl TrackEntry {
    /// Build an entry from a file name, deriving the id, title and mime type
    pub fn from_file_name(file_name: &str, size: u64) -> Self {
        let stem = Path::new(file_name)
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or(file_name);

        Self {
            track_id: track_id_for(file_name),
            file_name: file_name.to_string(),
            size,
            mime: mime_for(file_name).to_string(),
            duration: 0.0,
            title: stem.to_string(),
            artist: "Unknown".to_string(),
            album: String::new(),
        }
    }

    pub fn with_duration(mut self, duration: f64) -> Self {
        self.duration = duration;
        self
    }

    /// Fill duration and tags from the audio file at `path`. Entries for
    /// files that cannot be read keep their file-name defaults.
    pub fn with_metadata(mut self, path: &Path) -> Self {
        let tagged = match lofty::read_from_path(path) {
            Ok(tagged) => tagged,
            Err(e) => {
                debug!(path = %path.display(), error = %e, "No audio metadata");
                return self;
            }
        };
        self = self.with_duration(tagged.properties().duration().as_secs_f64());

        if let Some(tag) = tagged.primary_tag().or_else(|| tagged.first_tag()) {
            if let Some(title) = tag.title().filter(|t| !t.trim().is_empty()) {
                self.title = title.into_owned();
            }
            if let Some(artist) = tag.artist().filter(|a| !a.trim().is_empty()) {
                self.artist = artist.into_owned();
            }
            if let Some(album) = tag.album() {
                self.album = album.into_owned();
            }
        }
        self
    }
}

/// Ordered, immutable list of tracks. The order is the "natural" queue order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TrackIndex {
    tracks: Vec<TrackEntry>,
}

impl TrackIndex {
    pub fn new(tracks: Vec<TrackEntry>) -> Self {
        Self { tracks }
    }

    /// Scan a directory for audio files in natural file-name order
    #[instrument(skip(dir), fields(dir = %dir.as_ref().display()))]
    pub fn scan_dir<P: AsRef<Path>>(dir: P) -> Result<Self> {
        let dir = dir.as_ref();
        let mut files = Vec::new();
        for entry in fs::read_dir(dir)? {
            let entry = entry?;
            let metadata = entry.metadata()?;
            if !metadata.is_file() {
                continue;
            }
            let Some(name) = entry.file_name().to_str().map(str::to_string) else {
                continue;
            };
            if is_supported(&name) {
                files.push((name, metadata.len()));
            }
        }

        files.sort_by(|a, b| natural_cmp(&a.0, &b.0));
        debug!(count = files.len(), "Scanned track directory");

        Ok(Self::new(
            files
                .into_iter()
                .map(|(name, size)| {
                    TrackEntry::from_file_name(&name, size).with_metadata(&dir.join(&name))
                })
                .collect(),
        ))
    }

    /// Track ids in natural order
    pub fn ids(&self) -> Vec<TrackId> {
        self.tracks.iter().map(|t| t.track_id.clone()).collect()
    }

    pub fn get(&self, track_id: &str) -> Option<&TrackEntry> {
        self.tracks.iter().find(|t| t.track_id == track_id)
    }

    pub fn contains(&self, track_id: &str) -> bool {
        self.get(track_id).is_some()
    }

    pub fn position(&self, track_id: &str) -> Option<usize> {
        self.tracks.iter().position(|t| t.track_id == track_id)
    }

    /// Natural order rotated so that `head` comes first.
    /// Falls back to plain natural order when `head` is not indexed.
    pub fn ids_starting_at(&self, head: Option<&str>) -> Vec<TrackId> {
        let mut ids = self.ids();
        if let Some(idx) = head.and_then(|h| self.position(h)) {
            ids.rotate_left(idx);
        }
        ids
    }

    pub fn iter(&self) -> impl Iterator<Item = &TrackEntry> {
        self.tracks.iter()
    }

    pub fn len(&self) -> usize {
        self.tracks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tracks.is_empty()
    }
}

/// Stable id from a file name: 31-multiplier string hash in base 36, prefixed with `t`
pub fn track_id_for(file_name: &str) -> TrackId {
    let mut hash: u32 = 0;
    for unit in file_name.encode_utf16() {
        hash = hash.wrapping_mul(31).wrapping_add(unit as u32);
    }
    format!("t{}", to_base36(hash))
}

fn to_base36(mut n: u32) -> String {
    const DIGITS: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";
    if n == 0 {
        return "0".to_string();
    }
    let mut out = Vec::new();
    while n > 0 {
        out.push(DIGITS[(n % 36) as usize]);
        n /= 36;
    }
    out.reverse();
    String::from_utf8_lossy(&out).into_owned()
}

fn extension(file_name: &str) -> Option<String> {
    Path::new(file_name)
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
}

fn is_supported(file_name: &str) -> bool {
    extension(file_name).is_some_and(|ext| SUPPORTED_EXTENSIONS.contains(&ext.as_str()))
}

fn mime_for(file_name: &str) -> &'static str {
    match extension(file_name).as_deref() {
        Some("mp3") => "audio/mpeg",
        Some("m4a") | Some("m4b") | Some("mp4") => "audio/mp4",
        Some("aac") => "audio/aac",
        Some("flac") => "audio/flac",
        Some("ogg") => "audio/ogg",
        Some("opus") => "audio/opus",
        Some("wav") => "audio/wav",
        _ => "application/octet-stream",
    }
}

fn take_number(chars: &mut std::iter::Peekable<std::str::Chars<'_>>) -> String {
    let mut digits = String::new();
    while let Some(c) = chars.peek().copied().filter(|c| c.is_ascii_digit()) {
        digits.push(c);
        chars.next();
    }
    digits
}

/// Compare file names so that embedded numbers sort numerically ("2" < "10")
fn natural_cmp(a: &str, b: &str) -> std::cmp::Ordering {
    use std::cmp::Ordering;

    let mut a_chars = a.chars().peekable();
    let mut b_chars = b.chars().peekable();

    loop {
        match (a_chars.peek().copied(), b_chars.peek().copied()) {
            (None, None) => return Ordering::Equal,
            (None, Some(_)) => return Ordering::Less,
            (Some(_), None) => return Ordering::Greater,
            (Some(x), Some(y)) if x.is_ascii_digit() && y.is_ascii_digit() => {
                let da = take_number(&mut a_chars);
                let db = take_number(&mut b_chars);
                let ta = da.trim_start_matches('0');
                let tb = db.trim_start_matches('0');
                let ord = ta.len().cmp(&tb.len()).then_with(|| ta.cmp(tb));
                if ord != Ordering::Equal {
                    return ord;
                }
            }
            (Some(x), Some(y)) => {
                let ord = x.to_lowercase().cmp(y.to_lowercase());
                if ord != Ordering::Equal {
                    return ord;
                }
                a_chars.next();
                b_chars.next();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_track_id_is_stable() {
        assert_eq!(track_id_for("song.mp3"), track_id_for("song.mp3"));
        assert_ne!(track_id_for("a.mp3"), track_id_for("b.mp3"));
        assert!(track_id_for("a.mp3").starts_with('t'));
    }

    #[test]
    fn test_natural_order() {
        let mut names = vec!["10 end.mp3", "2 middle.mp3", "1 start.mp3"];
        names.sort_by(|a, b| natural_cmp(a, b));
        assert_eq!(names, vec!["1 start.mp3", "2 middle.mp3", "10 end.mp3"]);
    }

    #[test]
    fn test_scan_dir_filters_and_sorts() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("track10.mp3"), b"x").unwrap();
        fs::write(dir.path().join("track2.flac"), b"xy").unwrap();
        fs::write(dir.path().join("cover.jpg"), b"img").unwrap();

        let index = TrackIndex::scan_dir(dir.path()).unwrap();
        assert_eq!(index.len(), 2);

        let titles: Vec<_> = index.iter().map(|t| t.title.as_str()).collect();
        assert_eq!(titles, vec!["track2", "track10"]);
        assert_eq!(index.iter().next().unwrap().mime, "audio/flac");
    }

    /// One second of 16-bit mono silence at 8kHz
    fn one_second_wav() -> Vec<u8> {
        let data_len: u32 = 16_000;
        let mut wav = Vec::new();
        wav.extend_from_slice(b"RIFF");
        wav.extend_from_slice(&(36 + data_len).to_le_bytes());
        wav.extend_from_slice(b"WAVEfmt ");
        wav.extend_from_slice(&16u32.to_le_bytes());
        wav.extend_from_slice(&1u16.to_le_bytes()); // PCM
        wav.extend_from_slice(&1u16.to_le_bytes()); // mono
        wav.extend_from_slice(&8_000u32.to_le_bytes());
        wav.extend_from_slice(&16_000u32.to_le_bytes());
        wav.extend_from_slice(&2u16.to_le_bytes());
        wav.extend_from_slice(&16u16.to_le_bytes());
        wav.extend_from_slice(b"data");
        wav.extend_from_slice(&data_len.to_le_bytes());
        wav.resize(wav.len() + data_len as usize, 0);
        wav
    }

    #[test]
    fn test_scan_reads_duration_so_playback_can_end() {
        use crate::playback::{ClockedPlayer, PlayableTrack, Player};
        use std::sync::Arc;

        let dir = tempfile::tempdir().unwrap();
        let wav = one_second_wav();
        fs::write(dir.path().join("tone.wav"), &wav).unwrap();
        fs::write(dir.path().join("junk.mp3"), b"not audio").unwrap();

        let index = TrackIndex::scan_dir(dir.path()).unwrap();
        let tone = index.iter().find(|e| e.file_name == "tone.wav").unwrap();
        let junk = index.iter().find(|e| e.file_name == "junk.mp3").unwrap();
        assert!((tone.duration - 1.0).abs() < 0.01);
        assert_eq!(junk.duration, 0.0);
        assert_eq!(junk.title, "junk");

        let mut player = ClockedPlayer::new();
        player.load(PlayableTrack::new(
            tone.track_id.clone(),
            Arc::from(wav.as_slice()),
            Some(tone),
        ));
        player.seek(1e6);
        assert!(player.is_ended());
    }

    #[test]
    fn test_ids_starting_at() {
        let index = TrackIndex::new(vec![
            TrackEntry::from_file_name("a.mp3", 1),
            TrackEntry::from_file_name("b.mp3", 1),
            TrackEntry::from_file_name("c.mp3", 1),
        ]);
        let b = track_id_for("b.mp3");

        let rotated = index.ids_starting_at(Some(&b));
        assert_eq!(rotated[0], b);
        assert_eq!(rotated.len(), 3);

        assert_eq!(index.ids_starting_at(Some("missing")), index.ids());
    }
}
