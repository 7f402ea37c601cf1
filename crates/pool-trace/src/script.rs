//! Trace script parsing.
//!
//! One command per line; `#` starts a comment.
//!
//! ```text
//! alloc <name> <size> [align] [temp|top|clear]...
//! realloc <name> <size> [align] [temp|top]...
//! free <name>
//! fill <name> <byte>
//! check <name> <byte>
//! avail [temp]
//! largest [temp]
//! dump
//! verify
//! ```
//!
//! Numbers are decimal or `0x`-prefixed hexadecimal.

use std::num::ParseIntError;

use pool_alloc::AllocFlags;
use snafu::{OptionExt as _, ResultExt as _, Snafu};

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Command {
    Alloc {
        name: String,
        size: usize,
        align: usize,
        flags: AllocFlags,
    },
    Realloc {
        name: String,
        size: usize,
        align: usize,
        flags: AllocFlags,
    },
    Free {
        name: String,
    },
    Fill {
        name: String,
        byte: u8,
    },
    Check {
        name: String,
        byte: u8,
    },
    Avail {
        flags: AllocFlags,
    },
    Largest {
        flags: AllocFlags,
    },
    Dump,
    Verify,
}

/// A parsed command with its position in the script.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Line {
    pub(crate) number: usize,
    pub(crate) text: String,
    pub(crate) command: Command,
}

#[derive(Debug, Snafu)]
pub(crate) enum CommandError {
    #[snafu(display("unknown command `{name}`"))]
    UnknownCommand { name: String },
    #[snafu(display("missing {what}"))]
    MissingArgument { what: &'static str },
    #[snafu(display("invalid number `{text}`"))]
    BadNumber {
        text: String,
        source: ParseIntError,
    },
    #[snafu(display("unknown flag `{flag}`"))]
    UnknownFlag { flag: String },
    #[snafu(display("unexpected argument `{text}`"))]
    TrailingArgument { text: String },
}

#[derive(Debug, Snafu)]
#[snafu(display("line {line}: {source}"))]
pub(crate) struct ParseError {
    line: usize,
    source: CommandError,
}

/// Parses a whole script, stopping at the first malformed line.
pub(crate) fn parse(script: &str) -> Result<Vec<Line>, ParseError> {
    let mut lines = vec![];
    for (index, raw) in script.lines().enumerate() {
        let number = index + 1;
        let text = raw.split_once('#').map_or(raw, |(code, _)| code).trim();
        if text.is_empty() {
            continue;
        }
        let command = parse_command(text).context(ParseSnafu { line: number })?;
        lines.push(Line {
            number,
            text: text.to_owned(),
            command,
        });
    }
    Ok(lines)
}

fn parse_command(text: &str) -> Result<Command, CommandError> {
    let mut args = text.split_whitespace();
    let Some(name) = args.next() else {
        return MissingArgumentSnafu { what: "command" }.fail();
    };
    let command = match name {
        "alloc" | "realloc" => {
            let target = args.next().context(MissingArgumentSnafu { what: "name" })?;
            let size = args.next().context(MissingArgumentSnafu { what: "size" })?;
            let size = parse_number(size)?;
            let mut align = 0;
            let mut flags = AllocFlags::empty();
            for (i, arg) in args.by_ref().enumerate() {
                if i == 0 && arg.starts_with(|c: char| c.is_ascii_digit()) {
                    align = parse_number(arg)?;
                    continue;
                }
                let flag = match arg {
                    "temp" => AllocFlags::TEMP,
                    "top" => AllocFlags::TOP,
                    "clear" if name == "alloc" => AllocFlags::CLEAR,
                    _ => return UnknownFlagSnafu { flag: arg }.fail(),
                };
                flags.insert(flag);
            }
            let target = target.to_owned();
            if name == "alloc" {
                Command::Alloc {
                    name: target,
                    size,
                    align,
                    flags,
                }
            } else {
                Command::Realloc {
                    name: target,
                    size,
                    align,
                    flags,
                }
            }
        }
        "free" => Command::Free {
            name: args
                .next()
                .context(MissingArgumentSnafu { what: "name" })?
                .to_owned(),
        },
        "fill" | "check" => {
            let target = args.next().context(MissingArgumentSnafu { what: "name" })?;
            let byte = args.next().context(MissingArgumentSnafu { what: "byte" })?;
            let byte = parse_number(byte)?;
            let target = target.to_owned();
            if name == "fill" {
                Command::Fill { name: target, byte }
            } else {
                Command::Check { name: target, byte }
            }
        }
        "avail" | "largest" => {
            let flags = match args.next() {
                None => AllocFlags::empty(),
                Some("temp") => AllocFlags::TEMP,
                Some(flag) => return UnknownFlagSnafu { flag }.fail(),
            };
            if name == "avail" {
                Command::Avail { flags }
            } else {
                Command::Largest { flags }
            }
        }
        "dump" => Command::Dump,
        "verify" => Command::Verify,
        _ => return UnknownCommandSnafu { name }.fail(),
    };
    if let Some(extra) = args.next() {
        return TrailingArgumentSnafu { text: extra }.fail();
    }
    Ok(command)
}

fn parse_number<T>(text: &str) -> Result<T, CommandError>
where
    T: FromStrRadix,
{
    let (digits, radix) = match text.strip_prefix("0x") {
        Some(hex) => (hex, 16),
        None => (text, 10),
    };
    T::from_str_radix(digits, radix).context(BadNumberSnafu { text })
}

trait FromStrRadix: Sized {
    fn from_str_radix(text: &str, radix: u32) -> Result<Self, ParseIntError>;
}

impl FromStrRadix for usize {
    fn from_str_radix(text: &str, radix: u32) -> Result<Self, ParseIntError> {
        Self::from_str_radix(text, radix)
    }
}

impl FromStrRadix for u8 {
    fn from_str_radix(text: &str, radix: u32) -> Result<Self, ParseIntError> {
        Self::from_str_radix(text, radix)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn command(text: &str) -> Command {
        parse_command(text).unwrap()
    }

    #[test]
    fn parses_allocation_commands() {
        assert_eq!(
            command("alloc a 100"),
            Command::Alloc {
                name: "a".to_owned(),
                size: 100,
                align: 0,
                flags: AllocFlags::empty(),
            }
        );
        assert_eq!(
            command("alloc buf 0x200 64 temp top clear"),
            Command::Alloc {
                name: "buf".to_owned(),
                size: 0x200,
                align: 64,
                flags: AllocFlags::TEMP | AllocFlags::TOP | AllocFlags::CLEAR,
            }
        );
        assert_eq!(
            command("realloc buf 50 top"),
            Command::Realloc {
                name: "buf".to_owned(),
                size: 50,
                align: 0,
                flags: AllocFlags::TOP,
            }
        );
    }

    #[test]
    fn parses_other_commands() {
        assert_eq!(command("free a"), Command::Free { name: "a".to_owned() });
        assert_eq!(
            command("fill a 0xAB"),
            Command::Fill {
                name: "a".to_owned(),
                byte: 0xAB,
            }
        );
        assert_eq!(
            command("check a 7"),
            Command::Check {
                name: "a".to_owned(),
                byte: 7,
            }
        );
        assert_eq!(command("avail"), Command::Avail { flags: AllocFlags::empty() });
        assert_eq!(command("largest temp"), Command::Largest { flags: AllocFlags::TEMP });
        assert_eq!(command("dump"), Command::Dump);
        assert_eq!(command("verify"), Command::Verify);
    }

    #[test]
    fn rejects_malformed_commands() {
        assert!(matches!(parse_command("grow a 10"), Err(CommandError::UnknownCommand { .. })));
        assert!(matches!(parse_command("alloc a"), Err(CommandError::MissingArgument { what: "size" })));
        assert!(matches!(parse_command("alloc a ten"), Err(CommandError::BadNumber { .. })));
        assert!(matches!(parse_command("fill a 256"), Err(CommandError::BadNumber { .. })));
        assert!(matches!(parse_command("alloc a 10 16 fast"), Err(CommandError::UnknownFlag { .. })));
        assert!(matches!(parse_command("realloc a 10 clear"), Err(CommandError::UnknownFlag { .. })));
        assert!(matches!(parse_command("alloc a 10 top 16"), Err(CommandError::UnknownFlag { .. })));
        assert!(matches!(parse_command("free a b"), Err(CommandError::TrailingArgument { .. })));
        assert!(matches!(parse_command("avail main"), Err(CommandError::UnknownFlag { .. })));
    }

    #[test]
    fn script_skips_comments_and_numbers_lines() {
        let script = "# header\n\nalloc a 10   # first\n  free a\n";
        let lines = parse(script).unwrap();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0].number, 3);
        assert_eq!(lines[0].text, "alloc a 10");
        assert_eq!(lines[1].number, 4);
        assert_eq!(lines[1].command, Command::Free { name: "a".to_owned() });

        let err = parse("dump\nbogus\n").unwrap_err();
        assert_eq!(err.to_string(), "line 2: unknown command `bogus`");
    }
}
