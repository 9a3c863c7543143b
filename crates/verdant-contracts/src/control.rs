//! Operator commands typed while a job runs.

pub const CONTROL_HELP_COMMANDS: &[&str] = &["/select <step> <label>", "/cancel", "/status", "/help"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlCommand {
    Noop,
    Help,
    Status,
    Cancel,
    Select { step: u32, label: String },
    Invalid { raw: String, reason: String },
}

fn split_args(arg: &str) -> Vec<String> {
    if arg.trim().is_empty() {
        return Vec::new();
    }
    match shell_words::split(arg) {
        Ok(parts) => parts
            .into_iter()
            .filter(|value| !value.is_empty())
            .collect(),
        Err(_) => arg.split_whitespace().map(str::to_string).collect(),
    }
}

/// Normalizes a candidate label such as `3b` to `3B`.
pub fn normalize_label(raw: &str) -> Option<String> {
    let trimmed = raw.trim().trim_start_matches(['v', 'V']);
    let digits = trimmed
        .chars()
        .take_while(|ch| ch.is_ascii_digit())
        .count();
    if digits == 0 || digits == trimmed.len() {
        return None;
    }
    let (number, letter) = trimmed.split_at(digits);
    let mut letters = letter.chars();
    let first = letters.next()?;
    if letters.next().is_some() || !first.is_ascii_alphabetic() {
        return None;
    }
    Some(format!("{number}{}", first.to_ascii_uppercase()))
}

pub fn parse_control(text: &str) -> ControlCommand {
    let raw = text.trim();
    if raw.is_empty() {
        return ControlCommand::Noop;
    }
    let Some(tail) = raw.strip_prefix('/') else {
        return ControlCommand::Invalid {
            raw: raw.to_string(),
            reason: "commands start with '/'".to_string(),
        };
    };
    let command_len = tail
        .chars()
        .take_while(|ch| ch.is_ascii_alphanumeric() || *ch == '_')
        .count();
    let command = tail[..command_len].to_ascii_lowercase();
    let args = split_args(&tail[command_len..]);

    match command.as_str() {
        "help" | "h" => ControlCommand::Help,
        "status" => ControlCommand::Status,
        "cancel" | "stop" => ControlCommand::Cancel,
        "select" | "use" => {
            let invalid = |reason: &str| ControlCommand::Invalid {
                raw: raw.to_string(),
                reason: reason.to_string(),
            };
            match args.as_slice() {
                [step, label] => {
                    let Ok(step) = step.parse::<u32>() else {
                        return invalid("step must be a positive number");
                    };
                    if step == 0 {
                        return invalid("step must be a positive number");
                    }
                    match normalize_label(label) {
                        Some(label) => ControlCommand::Select { step, label },
                        None => invalid("label looks like 2B"),
                    }
                }
                [label] => match normalize_label(label) {
                    Some(label) => ControlCommand::Select { step: 0, label },
                    None => invalid("label looks like 2B"),
                },
                _ => invalid("usage: /select <step> <label>"),
            }
        }
        _ => ControlCommand::Invalid {
            raw: raw.to_string(),
            reason: format!("unknown command '/{command}'"),
        },
    }
}
