use clap::{builder::ValueParser, Arg, ArgAction, Command};
use tracing::Level;

pub const ARG_VERBOSITY: &str = "verbosity";

/// Levels enabled by one, two, three and four `-v`. Without the flag only errors are logged.
const LEVELS: [Level; 4] = [Level::WARN, Level::INFO, Level::DEBUG, Level::TRACE];

/// Tracing level for a verbosity count; `None` keeps the ERROR default.
#[must_use]
pub fn level(verbosity: u8) -> Option<Level> {
    match verbosity {
        0 => None,
        count => LEVELS.get(usize::from(count) - 1).copied().or(Some(Level::TRACE)),
    }
}

/// `TOKENGATE_LOG_LEVEL` takes either a count or a level name.
fn parse_verbosity(value: &str) -> Result<u8, String> {
    if let Ok(count) = value.parse::<u8>() {
        return Ok(count.min(4));
    }
    value
        .parse::<Level>()
        .map(|parsed| {
            LEVELS
                .iter()
                .position(|level| *level == parsed)
                .map_or(0, |index| u8::try_from(index + 1).unwrap_or(4))
        })
        .map_err(|_| format!("invalid log level '{value}': use error, warn, info, debug or trace"))
}

#[must_use]
pub fn validator_log_level() -> ValueParser {
    ValueParser::from(parse_verbosity)
}

#[must_use]
pub fn with_args(command: Command) -> Command {
    command.arg(
        Arg::new(ARG_VERBOSITY)
            .short('v')
            .long("verbose")
            .help("Log verbosity; repeat for more detail (-v warn, -vv info, -vvv debug, -vvvv trace)")
            .env("TOKENGATE_LOG_LEVEL")
            .global(true)
            .action(ArgAction::Count)
            .value_parser(validator_log_level()),
    )
}
