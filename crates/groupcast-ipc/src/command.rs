//! Operator control commands, as typed on the runtime console

use anyhow::{anyhow, bail, Result};
use std::path::PathBuf;

#[derive(Debug, Clone, PartialEq)]
pub enum ControlCommand {
    Start,
    Stop,
    Status,
    Flush,
    ForwardClear,
    IntakePause,
    IntakeResume,
    IntakeClear,
    SetRate(u32),
    SetCooldown(u64),
    ClientsReload { source: PathBuf },
    BulkStart {
        destination: String,
        source: PathBuf,
        delay_seconds: u64,
        rate_per_minute: Option<u32>,
    },
    BulkPause,
    BulkResume,
    BulkStop,
    BulkStatus,
    BacklogCheck { hours: Option<u64> },
    BacklogProcess { hours: Option<u64> },
    Help,
    Quit,
}

impl ControlCommand {
    pub fn parse(line: &str) -> Result<Self> {
        let words: Vec<&str> = line.split_whitespace().collect();
        let command = match words.as_slice() {
            ["start"] => ControlCommand::Start,
            ["stop"] => ControlCommand::Stop,
            ["status"] => ControlCommand::Status,
            ["flush"] => ControlCommand::Flush,
            ["forward", "clear"] => ControlCommand::ForwardClear,
            ["intake", "pause"] => ControlCommand::IntakePause,
            ["intake", "resume"] => ControlCommand::IntakeResume,
            ["intake", "clear"] => ControlCommand::IntakeClear,
            ["set", "rate", raw] => ControlCommand::SetRate(parse_number(raw, "rate_per_minute")?),
            ["set", "cooldown", raw] => {
                ControlCommand::SetCooldown(parse_number(raw, "cooldown_seconds")?)
            }
            ["set", ..] => bail!("usage: set rate <per_minute> | set cooldown <seconds>"),
            ["clients", "reload", source] => ControlCommand::ClientsReload {
                source: PathBuf::from(source),
            },
            ["bulk", "start", destination, source, rest @ ..] => {
                if rest.len() > 2 {
                    bail!("usage: bulk start <destination> <file> [delay_seconds] [rate_per_minute]");
                }
                let delay_seconds = match rest.first() {
                    Some(raw) => parse_number(raw, "delay_seconds")?,
                    None => 3,
                };
                let rate_per_minute = match rest.get(1) {
                    Some(raw) => Some(parse_number::<u32>(raw, "rate_per_minute")?),
                    None => None,
                };
                ControlCommand::BulkStart {
                    destination: destination.to_string(),
                    source: PathBuf::from(source),
                    delay_seconds,
                    rate_per_minute,
                }
            }
            ["bulk", "pause"] => ControlCommand::BulkPause,
            ["bulk", "resume"] => ControlCommand::BulkResume,
            ["bulk", "stop"] | ["bulk", "cancel"] => ControlCommand::BulkStop,
            ["bulk", "status"] => ControlCommand::BulkStatus,
            ["backlog", "check", rest @ ..] => ControlCommand::BacklogCheck {
                hours: parse_hours(rest)?,
            },
            ["backlog", "process", rest @ ..] => ControlCommand::BacklogProcess {
                hours: parse_hours(rest)?,
            },
            ["help"] | ["?"] => ControlCommand::Help,
            ["quit"] | ["exit"] => ControlCommand::Quit,
            [] => bail!("empty command"),
            _ => bail!("unknown command '{}', type 'help'", line.trim()),
        };
        Ok(command)
    }

    pub fn help() -> &'static str {
        "start | stop | status | flush | forward clear\n\
         intake pause | intake resume | intake clear\n\
         set rate <per_minute> | set cooldown <seconds> | clients reload <file>\n\
         bulk start <destination> <file> [delay_seconds] [rate_per_minute]\n\
         bulk pause | bulk resume | bulk stop | bulk status\n\
         backlog check [hours] | backlog process [hours]\n\
         quit"
    }
}

fn parse_number<T: std::str::FromStr>(raw: &str, what: &str) -> Result<T> {
    raw.parse()
        .map_err(|_| anyhow!("invalid {} '{}'", what, raw))
}

fn parse_hours(rest: &[&str]) -> Result<Option<u64>> {
    match rest {
        [] => Ok(None),
        [raw] => Ok(Some(parse_number(raw, "hours")?)),
        _ => bail!("usage: backlog check|process [hours]"),
    }
}

#[cfg(test)]
mod tests {
    use super::ControlCommand;
    use std::path::PathBuf;

    #[test]
    fn parses_bulk_start_with_defaults() {
        let cmd = ControlCommand::parse("bulk start 123@g.us /tmp/msgs.txt").expect("parse");
        assert_eq!(
            cmd,
            ControlCommand::BulkStart {
                destination: "123@g.us".to_string(),
                source: PathBuf::from("/tmp/msgs.txt"),
                delay_seconds: 3,
                rate_per_minute: None,
            }
        );
    }

    #[test]
    fn parses_bulk_start_with_pace() {
        let cmd = ControlCommand::parse("bulk start g msgs.txt 0 100").expect("parse");
        match cmd {
            ControlCommand::BulkStart {
                delay_seconds,
                rate_per_minute,
                ..
            } => {
                assert_eq!(delay_seconds, 0);
                assert_eq!(rate_per_minute, Some(100));
            }
            other => panic!("unexpected command: {:?}", other),
        }
    }

    #[test]
    fn rejects_bad_numbers_and_unknown_words() {
        assert!(ControlCommand::parse("bulk start g msgs.txt soon").is_err());
        assert!(ControlCommand::parse("launch").is_err());
        assert!(ControlCommand::parse("   ").is_err());
    }

    #[test]
    fn parses_backlog_hours() {
        assert_eq!(
            ControlCommand::parse("backlog check 6").expect("parse"),
            ControlCommand::BacklogCheck { hours: Some(6) }
        );
        assert_eq!(
            ControlCommand::parse("backlog process").expect("parse"),
            ControlCommand::BacklogProcess { hours: None }
        );
    }

    #[test]
    fn parses_runtime_settings_and_intake_controls() {
        assert_eq!(
            ControlCommand::parse("set rate 12").expect("parse"),
            ControlCommand::SetRate(12)
        );
        assert_eq!(
            ControlCommand::parse("set cooldown 0").expect("parse"),
            ControlCommand::SetCooldown(0)
        );
        assert_eq!(
            ControlCommand::parse("clients reload clients.txt").expect("parse"),
            ControlCommand::ClientsReload {
                source: PathBuf::from("clients.txt")
            }
        );
        assert_eq!(
            ControlCommand::parse("intake pause").expect("parse"),
            ControlCommand::IntakePause
        );
        assert!(ControlCommand::parse("set rate fast").is_err());
        assert!(ControlCommand::parse("set volume 3").is_err());
    }
}
