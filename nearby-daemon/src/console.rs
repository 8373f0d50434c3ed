//! Line-oriented shell: commands on stdin, one JSON event per line on stdout.

use nearby_core::Event;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tracing::warn;

use crate::engine::Command;

const USAGE: &str = "commands: advertise, stop-advertising, browse, stop-browsing, \
invite <peer>, accept <peer>, decline <peer>, send <text>, peers, nearby, quit";

/// Parse one input line. Blank lines are `Ok(None)`. Message text is kept verbatim after the
/// single separator following the command word; peer arguments are trimmed.
pub fn parse_command(line: &str) -> Result<Option<Command>, String> {
    let line = line.trim_end_matches(['\r', '\n']).trim_start();
    if line.trim_end().is_empty() {
        return Ok(None);
    }
    let (word, text) = line.split_once(char::is_whitespace).unwrap_or((line, ""));
    let arg = |make: fn(String) -> Command, what: &str, value: &str| {
        if value.is_empty() {
            Err(format!("{word}: missing {what}"))
        } else {
            Ok(Some(make(value.to_string())))
        }
    };
    let needs_arg = |make: fn(String) -> Command, what: &str| arg(make, what, text.trim());
    match word.to_ascii_lowercase().as_str() {
        "advertise" | "host" => Ok(Some(Command::StartAdvertising)),
        "stop-advertising" | "unhost" => Ok(Some(Command::StopAdvertising)),
        "browse" | "join" => Ok(Some(Command::StartBrowsing)),
        "stop-browsing" => Ok(Some(Command::StopBrowsing)),
        "invite" => needs_arg(Command::Invite, "peer"),
        "accept" => needs_arg(Command::Accept, "peer"),
        "decline" => needs_arg(Command::Decline, "peer"),
        "send" | "say" => arg(Command::Send, "text", text),
        "peers" => Ok(Some(Command::ListPeers)),
        "nearby" => Ok(Some(Command::ListNearby)),
        "quit" | "exit" => Ok(Some(Command::Shutdown)),
        _ => Err(format!("unknown command {word:?}; {USAGE}")),
    }
}

pub fn render(event: &Event) -> String {
    match serde_json::to_string(event) {
        Ok(line) => line,
        Err(e) => {
            warn!(error = %e, "event not serializable");
            String::new()
        }
    }
}

/// Feed stdin to the engine until `quit` or end of input. Parse errors go straight to the shell.
pub async fn read_commands(commands: mpsc::UnboundedSender<Command>, shell: mpsc::UnboundedSender<Event>) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => return,
            Err(e) => {
                warn!(error = %e, "stdin read failed");
                return;
            }
        };
        match parse_command(&line) {
            Ok(None) => {}
            Ok(Some(Command::Shutdown)) => return,
            Ok(Some(cmd)) => {
                if commands.send(cmd).is_err() {
                    return;
                }
            }
            Err(reason) => {
                let _ = shell.send(Event::CommandRejected { reason });
            }
        }
    }
}

/// Print events until every sender is gone.
pub async fn print_events(mut events: mpsc::UnboundedReceiver<Event>) {
    let mut stdout = tokio::io::stdout();
    while let Some(event) = events.recv().await {
        let mut line = render(&event);
        if line.is_empty() {
            continue;
        }
        line.push('\n');
        if stdout.write_all(line.as_bytes()).await.is_err() {
            return;
        }
        let _ = stdout.flush().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nearby_core::{PeerId, PeerIdentity};

    #[test]
    fn parses_commands_and_aliases() {
        assert_eq!(parse_command("advertise"), Ok(Some(Command::StartAdvertising)));
        assert_eq!(parse_command("  HOST "), Ok(Some(Command::StartAdvertising)));
        assert_eq!(parse_command("join"), Ok(Some(Command::StartBrowsing)));
        assert_eq!(parse_command("unhost"), Ok(Some(Command::StopAdvertising)));
        assert_eq!(parse_command("stop-browsing"), Ok(Some(Command::StopBrowsing)));
        assert_eq!(parse_command("peers"), Ok(Some(Command::ListPeers)));
        assert_eq!(parse_command("nearby"), Ok(Some(Command::ListNearby)));
        assert_eq!(parse_command("exit"), Ok(Some(Command::Shutdown)));
        assert_eq!(parse_command("   "), Ok(None));
    }

    #[test]
    fn argument_keeps_inner_spacing() {
        assert_eq!(
            parse_command("send hello   there "),
            Ok(Some(Command::Send("hello   there ".to_string())))
        );
        assert_eq!(
            parse_command("invite Living Room"),
            Ok(Some(Command::Invite("Living Room".to_string())))
        );
        assert_eq!(
            parse_command("accept 3fa2"),
            Ok(Some(Command::Accept("3fa2".to_string())))
        );
    }

    #[test]
    fn message_text_keeps_leading_whitespace() {
        assert_eq!(
            parse_command("send   indented"),
            Ok(Some(Command::Send("  indented".to_string())))
        );
        assert_eq!(
            parse_command("say\t\tcode\r"),
            Ok(Some(Command::Send("\tcode".to_string())))
        );
        assert_eq!(
            parse_command("  invite   Bob  "),
            Ok(Some(Command::Invite("Bob".to_string())))
        );
    }

    #[test]
    fn missing_argument_and_unknown_word_are_errors() {
        assert!(parse_command("send").unwrap_err().contains("missing text"));
        assert!(parse_command("decline  ").unwrap_err().contains("missing peer"));
        assert!(parse_command("dance").unwrap_err().contains("unknown command"));
    }

    #[test]
    fn events_render_as_single_json_lines() {
        let bob = PeerIdentity::new(PeerId::from_bytes([7; 16]), "Bob");
        let line = render(&Event::MessageReceived {
            from: bob,
            text: "hi\nthere".to_string(),
        });
        assert!(!line.contains('\n'));
        let value: serde_json::Value = serde_json::from_str(&line).unwrap();
        assert_eq!(value["event"], "message_received");
        assert_eq!(value["text"], "hi\nthere");
    }
}
