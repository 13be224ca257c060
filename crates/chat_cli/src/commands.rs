/// One `field=value` pair of a `/form` command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldAssignment {
    pub field_id: String,
    pub raw: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SlashCommand {
    Help,
    Clear,
    Cancel,
    Quit,
    Form(Vec<FieldAssignment>),
    Malformed { command: String, reason: String },
    Unknown(String),
}

pub fn parse_slash_command(input: &str) -> Option<SlashCommand> {
    let trimmed = input.trim();
    if !trimmed.starts_with('/') {
        return None;
    }

    let (command, rest) = match trimmed.split_once(char::is_whitespace) {
        Some((command, rest)) => (command, rest.trim()),
        None => (trimmed, ""),
    };

    let parsed = match command {
        "/help" => SlashCommand::Help,
        "/clear" => SlashCommand::Clear,
        "/cancel" => SlashCommand::Cancel,
        "/quit" => SlashCommand::Quit,
        "/form" => match parse_assignments(rest) {
            Ok(assignments) => SlashCommand::Form(assignments),
            Err(reason) => SlashCommand::Malformed {
                command: command.to_string(),
                reason,
            },
        },
        _ => SlashCommand::Unknown(command.to_string()),
    };

    Some(parsed)
}

/// Splits `a=1 b="two words"` into assignments. Double quotes group spaces.
fn parse_assignments(input: &str) -> Result<Vec<FieldAssignment>, String> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut quoted = false;
    for ch in input.chars() {
        match ch {
            '"' => quoted = !quoted,
            ch if ch.is_whitespace() && !quoted => {
                if !current.is_empty() {
                    tokens.push(std::mem::take(&mut current));
                }
            }
            ch => current.push(ch),
        }
    }
    if quoted {
        return Err("unterminated quote".to_string());
    }
    if !current.is_empty() {
        tokens.push(current);
    }

    tokens
        .into_iter()
        .map(|token| match token.split_once('=') {
            Some((field_id, raw)) if !field_id.is_empty() => Ok(FieldAssignment {
                field_id: field_id.to_string(),
                raw: raw.to_string(),
            }),
            _ => Err(format!("expected field=value, got '{token}'")),
        })
        .collect()
}
