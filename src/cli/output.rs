use std::io::IsTerminal;

use colored::Colorize;

use crate::retry::{AuthRequiredPayload, InvocationOutcome};

pub fn is_tty() -> bool {
    std::io::stdout().is_terminal()
}

fn paint(text: &str, tty: bool, style: fn(&str) -> colored::ColoredString) -> String {
    if tty {
        style(text).to_string()
    } else {
        text.to_string()
    }
}

pub fn ok_label(text: &str, tty: bool) -> String {
    paint(text, tty, |t| t.green().bold())
}

pub fn warn_label(text: &str, tty: bool) -> String {
    paint(text, tty, |t| t.yellow().bold())
}

pub fn error_label(text: &str, tty: bool) -> String {
    paint(text, tty, |t| t.red().bold())
}

/// Lines of the sign-in prompt. A terminal gets the link once, on its own
/// underlined line; anything else gets the payload message, which already
/// carries the link.
pub fn sign_in_prompt_lines(payload: &AuthRequiredPayload, tty: bool) -> Vec<String> {
    let mut lines = vec![warn_label("Sign-in required", tty)];
    if tty {
        lines.push("Open this link in your browser and complete the sign-in:".to_string());
        lines.push(format!("  {}", payload.sign_in_url.underline()));
    } else {
        lines.push(payload.message.clone());
    }
    lines
}

/// Sign-in prompt, written to stderr so stdout stays machine-readable.
pub fn print_sign_in_prompt(payload: &AuthRequiredPayload, tty: bool) {
    for line in sign_in_prompt_lines(payload, tty) {
        eprintln!("{line}");
    }
}

pub fn print_outcome(outcome: &InvocationOutcome, json: bool, tty: bool) {
    if json {
        println!(
            "{}",
            serde_json::to_string_pretty(outcome).unwrap_or_default()
        );
        return;
    }
    match outcome {
        InvocationOutcome::Success { result } => {
            println!("{}", serde_json::to_string_pretty(result).unwrap_or_default());
        }
        InvocationOutcome::AuthRequired(payload) => {
            print_sign_in_prompt(payload, tty);
            println!("resume token: {}", payload.resume_token);
        }
        InvocationOutcome::Failed {
            tool,
            scopes,
            attempts,
        } => {
            eprintln!(
                "{}: '{tool}' still lacked authorization for [{scopes}] after {attempts} attempts",
                error_label("Failed", tty)
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn labels_are_plain_without_tty() {
        assert_eq!(ok_label("signed in", false), "signed in");
        assert_eq!(error_label("Failed", false), "Failed");
    }

    fn payload() -> AuthRequiredPayload {
        let url = "https://login.example/authorize?state=abc";
        AuthRequiredPayload {
            sign_in_url: url.into(),
            resume_token: "r".into(),
            message: format!("Sign-in is required to continue. Open this link: {url}"),
            scopes: crate::token::ScopeSet::default(),
        }
    }

    #[test]
    fn terminal_prompt_shows_link_once() {
        let p = payload();
        for tty in [true, false] {
            let text = sign_in_prompt_lines(&p, tty).join("\n");
            assert_eq!(text.matches(p.sign_in_url.as_str()).count(), 1, "tty={tty}");
        }
    }
}
