#[cfg(test)]
#[path = "slash_commands_test.rs"]
mod tests;

pub struct SlashCommand {
    command: String,
    pub args: Vec<String>,
}

impl SlashCommand {
    pub fn parse(text: &str) -> Option<SlashCommand> {
        let mut args = text
            .trim()
            .split(' ')
            .filter(|e| return !e.is_empty())
            .map(|e| return e.to_string())
            .collect::<Vec<String>>();
        if args.is_empty() {
            return None;
        }
        let prefix = args.remove(0);

        let cmd = SlashCommand {
            command: prefix,
            args,
        };
        if cmd.is_quit() || cmd.is_help() || cmd.is_cancel() || cmd.is_summarize() {
            return Some(cmd);
        }

        return None;
    }

    pub fn is_quit(&self) -> bool {
        return ["/q", "/quit", "/exit"].contains(&self.command.as_str());
    }

    pub fn is_help(&self) -> bool {
        return ["/h", "/help"].contains(&self.command.as_str());
    }

    pub fn is_cancel(&self) -> bool {
        return ["/x", "/cancel"].contains(&self.command.as_str());
    }

    pub fn is_summarize(&self) -> bool {
        return ["/s", "/summarize"].contains(&self.command.as_str());
    }

    /// Arguments joined back together, for paths containing spaces.
    pub fn argument(&self) -> Option<String> {
        if self.args.is_empty() {
            return None;
        }

        return Some(self.args.join(" "));
    }
}
