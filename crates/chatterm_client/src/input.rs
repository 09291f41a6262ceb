#![forbid(unsafe_code)]

use chatterm_domain::ChannelName;

/// A line typed on stdin.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
	Join(ChannelName),
	Part(ChannelName),
	/// Plain text for the current channel.
	Say(String),
	Quit,
}

/// Parse one input line. Blank lines yield `Ok(None)`.
pub fn parse_input(line: &str) -> Result<Option<Command>, String> {
	let line = line.trim_end_matches(['\r', '\n']);
	if line.trim().is_empty() {
		return Ok(None);
	}

	let Some(rest) = line.strip_prefix('/') else {
		return Ok(Some(Command::Say(line.to_string())));
	};

	let (cmd, arg) = rest.split_once(char::is_whitespace).unwrap_or((rest, ""));
	let arg = arg.trim();

	match cmd {
		"join" | "j" => channel_arg(cmd, arg).map(|c| Some(Command::Join(c))),
		"part" | "leave" => channel_arg(cmd, arg).map(|c| Some(Command::Part(c))),
		"quit" | "q" => Ok(Some(Command::Quit)),
		// `//text` sends text starting with a slash
		other if other.starts_with('/') => Ok(Some(Command::Say(line[1..].to_string()))),
		other => Err(format!("unknown command /{other}")),
	}
}

fn channel_arg(cmd: &str, arg: &str) -> Result<ChannelName, String> {
	if arg.is_empty() {
		return Err(format!("/{cmd} needs a channel"));
	}
	ChannelName::new(arg).map_err(|e| format!("/{cmd}: {e}"))
}
