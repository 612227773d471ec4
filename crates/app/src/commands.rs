//! Interactive commands typed by a listening participant

use unison_core::{Action, TrackIndex};

pub const HELP: &str = "commands: play | pause | next | prev | seek <secs> | \
nudge <track> | shuffle | reset | status | quit";

#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Control(Action),
    /// Move a track to next-up; resolved against the index when sent
    Nudge(String),
    Status,
    Help,
    Quit,
}

/// Parse one input line. `Err` carries a message for the user.
pub fn parse(line: &str) -> Result<Option<Command>, String> {
    let mut words = line.split_whitespace();
    let Some(word) = words.next() else {
        return Ok(None);
    };
    let rest = words.collect::<Vec<_>>().join(" ");

    let command = match word.to_ascii_lowercase().as_str() {
        "play" => Command::Control(Action::Play),
        "pause" => Command::Control(Action::Pause),
        "next" | "skip" => Command::Control(Action::Next),
        "prev" | "back" => Command::Control(Action::Prev),
        "shuffle" => Command::Control(Action::Shuffle),
        "reset" => Command::Control(Action::Reset),
        "seek" => {
            let position: f64 = rest
                .parse()
                .map_err(|_| format!("seek needs a number of seconds, got {:?}", rest))?;
            if !position.is_finite() {
                return Err("seek position must be finite".into());
            }
            Command::Control(Action::Seek { position })
        }
        "nudge" if rest.is_empty() => return Err("nudge needs a track".into()),
        "nudge" => Command::Nudge(rest),
        "status" | "s" => Command::Status,
        "help" | "?" => Command::Help,
        "quit" | "exit" | "q" => Command::Quit,
        other => return Err(format!("unknown command {:?}; {}", other, HELP)),
    };
    Ok(Some(command))
}

/// Find a track by id, file name or case-insensitive title
pub fn resolve_track(index: &TrackIndex, query: &str) -> Option<String> {
    index
        .iter()
        .find(|e| e.track_id == query || e.file_name == query)
        .or_else(|| index.iter().find(|e| e.title.eq_ignore_ascii_case(query)))
        .map(|e| e.track_id.clone())
}

#[cfg(test)]
mod tests {
    use super::*;
    use unison_core::TrackEntry;

    #[test]
    fn test_parse_controls() {
        assert_eq!(parse("play"), Ok(Some(Command::Control(Action::Play))));
        assert_eq!(parse("  NEXT "), Ok(Some(Command::Control(Action::Next))));
        assert_eq!(
            parse("seek 42.5"),
            Ok(Some(Command::Control(Action::Seek { position: 42.5 })))
        );
        assert_eq!(parse(""), Ok(None));
    }

    #[test]
    fn test_parse_rejects_bad_input() {
        assert!(parse("seek soon").is_err());
        assert!(parse("seek inf").is_err());
        assert!(parse("nudge").is_err());
        assert!(parse("dance").is_err());
    }

    #[test]
    fn test_nudge_keeps_spaces_and_resolves_title() {
        let index = TrackIndex::new(vec![
            TrackEntry::from_file_name("Blue Monday.mp3", 1),
            TrackEntry::from_file_name("other.mp3", 1),
        ]);

        let Ok(Some(Command::Nudge(query))) = parse("nudge blue monday") else {
            panic!("expected nudge");
        };
        assert_eq!(
            resolve_track(&index, &query),
            Some(index.ids()[0].clone())
        );
        assert_eq!(resolve_track(&index, "other.mp3"), Some(index.ids()[1].clone()));
        assert_eq!(resolve_track(&index, "missing"), None);
    }
}
