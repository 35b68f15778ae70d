//! Line protocol for driving the gate from a platform shim.
//!
//! Input, one command per line:
//!
//! ```text
//! focus <identifier>     foreground changed
//! open                   "open anyway" on the current gate
//! keep                   "keep focus" on the current gate
//! status                 print the gate snapshot
//! apps [query]           search installed applications, grouped by category
//! blocked                list the current block set
//! block <identifier>     add to the block set and save settings
//! unblock <identifier>   remove from the block set and save settings
//! press                  spend one of the daily opens and start its wait
//! cancel                 cancel that wait, giving the open back
//! opens                  print the daily opens counter
//! prompts                print the mindful prompt, daily task and quote
//! usage                  print gate usage not yet backed up
//! backup                 send that usage to the settings service now
//! refresh                pull settings and prompts now
//! quit
//! ```
//!
//! Output is one JSON object per line.

use anyhow::Result;
use serde::Serialize;
use tokio::io::{AsyncWrite, AsyncWriteExt};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FeedCommand {
    Focus(String),
    OpenAnyway,
    KeepFocus,
    Status,
    Apps(String),
    Blocked,
    Block(String),
    Unblock(String),
    PressOpen,
    CancelOpen,
    Opens,
    Prompts,
    Usage,
    Backup,
    Refresh,
    Quit,
}

/// Parse one input line. Blank lines and `#` comments give `Ok(None)`.
pub fn parse_line(line: &str) -> Result<Option<FeedCommand>, String> {
    let line = line.trim();
    if line.is_empty() || line.starts_with('#') {
        return Ok(None);
    }

    let (verb, rest) = match line.split_once(char::is_whitespace) {
        Some((verb, rest)) => (verb, rest.trim()),
        None => (line, ""),
    };

    let with_identifier = |make: fn(String) -> FeedCommand| {
        if rest.is_empty() {
            Err(format!("`{}` needs an application identifier", verb))
        } else {
            Ok(Some(make(rest.to_string())))
        }
    };

    match verb.to_ascii_lowercase().as_str() {
        "focus" => with_identifier(FeedCommand::Focus),
        "block" => with_identifier(FeedCommand::Block),
        "unblock" => with_identifier(FeedCommand::Unblock),
        "open" => Ok(Some(FeedCommand::OpenAnyway)),
        "keep" => Ok(Some(FeedCommand::KeepFocus)),
        "status" => Ok(Some(FeedCommand::Status)),
        "apps" => Ok(Some(FeedCommand::Apps(rest.to_string()))),
        "blocked" => Ok(Some(FeedCommand::Blocked)),
        "press" => Ok(Some(FeedCommand::PressOpen)),
        "cancel" => Ok(Some(FeedCommand::CancelOpen)),
        "opens" => Ok(Some(FeedCommand::Opens)),
        "prompts" => Ok(Some(FeedCommand::Prompts)),
        "usage" => Ok(Some(FeedCommand::Usage)),
        "backup" => Ok(Some(FeedCommand::Backup)),
        "refresh" => Ok(Some(FeedCommand::Refresh)),
        "quit" | "exit" => Ok(Some(FeedCommand::Quit)),
        other => Err(format!("unknown command `{}`", other)),
    }
}

#[derive(Debug, Serialize)]
struct ErrorLine<'a> {
    error: &'a str,
}

pub async fn write_json<W, T>(out: &mut W, value: &T) -> Result<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize + ?Sized,
{
    let mut line = serde_json::to_vec(value)?;
    line.push(b'\n');
    out.write_all(&line).await?;
    out.flush().await?;
    Ok(())
}

pub async fn write_error<W>(out: &mut W, message: &str) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    write_json(out, &ErrorLine { error: message }).await
}
