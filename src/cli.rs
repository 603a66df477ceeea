//! Minimal CLI parsing for the binary's commands.

use std::env;

const DEFAULT_LIST_LIMIT: u32 = 20;
const DEFAULT_TAIL_LINES: usize = 200;

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum Command {
    /// Scheduler and housekeeping until Ctrl-C
    #[default]
    Serve,
    /// One manual scan, synchronously
    Scan,
    Cancel { job_id: String },
    Jobs { limit: u32 },
    Tail { job_id: String, lines: usize },
    Report { limit: u32 },
    Libraries,
    Help,
}

pub const USAGE: &str = "\
usage: smart-refresher [command]

commands:
  serve                   run the daily scheduler until interrupted (default)
  scan                    run one scan now and print its statistics
  cancel <job_id>         request cancellation of a running scan
  jobs [limit]            list recent scan jobs
  tail <job_id> [lines]   print the end of a scan job's log
  report [limit]          print item totals and recent outcomes
  libraries               list movie and show libraries on the server";

impl Command {
    pub fn from_args() -> Result<Self, String> {
        Self::parse(env::args().skip(1))
    }

    pub fn parse(args: impl IntoIterator<Item = String>) -> Result<Self, String> {
        let mut args = args.into_iter();
        let Some(command) = args.next() else {
            return Ok(Command::Serve);
        };

        let parsed = match command.as_str() {
            "serve" => Command::Serve,
            "scan" => Command::Scan,
            "cancel" => Command::Cancel {
                job_id: args.next().ok_or("cancel requires a job id")?,
            },
            "jobs" => Command::Jobs {
                limit: parse_number(args.next(), DEFAULT_LIST_LIMIT)?,
            },
            "tail" => Command::Tail {
                job_id: args.next().ok_or("tail requires a job id")?,
                lines: parse_number(args.next(), DEFAULT_TAIL_LINES)?,
            },
            "report" => Command::Report {
                limit: parse_number(args.next(), DEFAULT_LIST_LIMIT)?,
            },
            "libraries" => Command::Libraries,
            "help" | "-h" | "--help" => Command::Help,
            other => return Err(format!("unknown command: {}", other)),
        };

        if let Some(extra) = args.next() {
            return Err(format!("unexpected argument: {}", extra));
        }
        Ok(parsed)
    }
}

fn parse_number<T: std::str::FromStr>(value: Option<String>, default: T) -> Result<T, String> {
    match value {
        None => Ok(default),
        Some(v) => v.parse().map_err(|_| format!("not a number: {}", v)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn parse(args: &[&str]) -> Result<Command, String> {
        Command::parse(args.iter().map(|s| s.to_string()))
    }

    #[test]
    fn test_defaults_to_serve() {
        assert_eq!(parse(&[]).unwrap(), Command::Serve);
    }

    #[test]
    fn test_commands_with_arguments() {
        assert_eq!(
            parse(&["cancel", "abc"]).unwrap(),
            Command::Cancel { job_id: "abc".into() }
        );
        assert_eq!(
            parse(&["tail", "abc"]).unwrap(),
            Command::Tail { job_id: "abc".into(), lines: DEFAULT_TAIL_LINES }
        );
        assert_eq!(
            parse(&["tail", "abc", "15"]).unwrap(),
            Command::Tail { job_id: "abc".into(), lines: 15 }
        );
        assert_eq!(parse(&["jobs", "5"]).unwrap(), Command::Jobs { limit: 5 });
        assert_eq!(parse(&["report"]).unwrap(), Command::Report { limit: DEFAULT_LIST_LIMIT });
    }

    #[test]
    fn test_rejects_bad_input() {
        assert!(parse(&["cancel"]).is_err());
        assert!(parse(&["jobs", "many"]).is_err());
        assert!(parse(&["scan", "now"]).is_err());
        assert!(parse(&["explode"]).is_err());
    }
}
