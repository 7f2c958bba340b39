//! Input sanitizer
//!
//! Turns raw inbound chat text into a [`Verdict`]: a bot-control directive,
//! code to forward to the interpreter, a rejection, or nothing at all.

use std::fmt;

use anyhow::{Context, Result};
use regex::Regex;

use crate::config::{Config, SanitizerConfig};

/// Bot-control commands handled without the interpreter
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Directive {
    /// Show the command list
    Help,
    /// Make sure the chat has a running interpreter
    Start,
    /// Close the chat's interpreter (`/kill` or `/stop`)
    Stop,
    /// Show session state and bot counters
    Status,
}

/// Why a message was refused
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Rejection {
    /// The code matched a denylist rule
    Denylisted { pattern: String, matched: String },
}

impl fmt::Display for Rejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Rejection::Denylisted { matched, .. } => write!(
                f,
                "Sorry, your code seems to contain a forbidden identifier: {}",
                matched
            ),
        }
    }
}

/// Outcome of classifying one inbound message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Control(Directive),
    /// Normalized code, ready to write to the interpreter
    Forward(String),
    Reject(Rejection),
    /// Not meant for this bot
    Ignore,
}

struct DenyRule {
    pattern: String,
    regex: Regex,
}

/// Classifier for inbound chat text
pub struct Sanitizer {
    code_prefix: String,
    require_code_prefix: bool,
    terminator: String,
    denylist: Vec<DenyRule>,
}

impl Sanitizer {
    /// Build a sanitizer, compiling every denylist pattern
    pub fn new(config: &SanitizerConfig, terminator: &str) -> Result<Self, regex::Error> {
        let denylist = config
            .denylist
            .iter()
            .map(|pattern| {
                Ok(DenyRule {
                    pattern: pattern.clone(),
                    regex: Regex::new(pattern)?,
                })
            })
            .collect::<Result<Vec<_>, regex::Error>>()?;

        Ok(Self {
            code_prefix: config.code_prefix.clone(),
            require_code_prefix: config.require_code_prefix,
            terminator: terminator.to_string(),
            denylist,
        })
    }

    pub fn from_config(config: &Config) -> Result<Self> {
        Self::new(&config.sanitizer, &config.interpreter.statement_terminator)
            .context("Invalid sanitizer.denylist pattern")
    }

    pub fn code_prefix(&self) -> &str {
        &self.code_prefix
    }

    /// Classify `text`. The verdict depends only on the text, so it is the
    /// same whether or not the chat has a session.
    pub fn classify(&self, text: &str) -> Verdict {
        let trimmed = text.trim_start();

        let code = if trimmed.starts_with('/') {
            let (word, rest) = match trimmed.find(char::is_whitespace) {
                Some(end) => (&trimmed[..end], &trimmed[end..]),
                None => (trimmed, ""),
            };
            // Group chats address commands as /cmd@botname
            let command = word.split('@').next().unwrap_or(word);

            match command {
                "/help" => return Verdict::Control(Directive::Help),
                "/start" => return Verdict::Control(Directive::Start),
                "/kill" | "/stop" => return Verdict::Control(Directive::Stop),
                "/status" => return Verdict::Control(Directive::Status),
                prefix if prefix == self.code_prefix => rest,
                _ => return Verdict::Ignore,
            }
        } else if self.require_code_prefix {
            return Verdict::Ignore;
        } else {
            text
        };

        if code.trim().is_empty() {
            return Verdict::Ignore;
        }
        if let Some(rejection) = self.check_denylist(code) {
            return Verdict::Reject(rejection);
        }
        Verdict::Forward(self.normalize(code))
    }

    /// First denylist rule matching anywhere in `code`, across all lines
    pub fn check_denylist(&self, code: &str) -> Option<Rejection> {
        self.denylist.iter().find_map(|rule| {
            rule.regex.find(code).map(|found| Rejection::Denylisted {
                pattern: rule.pattern.clone(),
                matched: found.as_str().to_string(),
            })
        })
    }

    /// Trim surrounding whitespace and make sure the statement terminator
    /// ends the code.
    pub fn normalize(&self, code: &str) -> String {
        let mut code = code.trim().to_string();
        if !self.terminator.is_empty() && !code.ends_with(&self.terminator) {
            code.push_str(&self.terminator);
        }
        code
    }

    /// Reply to `/help`
    pub fn help_text(&self) -> String {
        let mut lines = vec![
            "Hi. I run an interpreter for this chat and relay its output back here.".to_string(),
            "My available commands are:".to_string(),
            "  /help - show this help message".to_string(),
            "  /start - start a new interpreter session".to_string(),
            "  /kill or /stop - close the session in use".to_string(),
            "  /status - show the session state".to_string(),
            format!(
                "  {} <code> - send code to the interpreter (code may continue over several messages)",
                self.code_prefix
            ),
        ];
        if !self.require_code_prefix {
            lines.push("Plain messages are sent to the interpreter as code too.".to_string());
        }
        lines.join("\n")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sanitizer() -> Sanitizer {
        Sanitizer::new(&SanitizerConfig::default(), ";;").unwrap()
    }

    fn forward(text: &str) -> Verdict {
        Verdict::Forward(text.to_string())
    }

    #[test]
    fn test_directives() {
        let s = sanitizer();
        assert_eq!(s.classify("/help"), Verdict::Control(Directive::Help));
        assert_eq!(s.classify("/start"), Verdict::Control(Directive::Start));
        assert_eq!(s.classify("/kill"), Verdict::Control(Directive::Stop));
        assert_eq!(s.classify("/stop now"), Verdict::Control(Directive::Stop));
        assert_eq!(s.classify("  /status"), Verdict::Control(Directive::Status));
        assert_eq!(
            s.classify("/help@ocaml_bot"),
            Verdict::Control(Directive::Help)
        );
    }

    #[test]
    fn test_unknown_commands_are_ignored() {
        let s = sanitizer();
        assert_eq!(s.classify("/weather"), Verdict::Ignore);
        assert_eq!(s.classify("/helpme"), Verdict::Ignore);
        assert_eq!(s.classify("/ml"), Verdict::Ignore);
        assert_eq!(s.classify("/ml   \n "), Verdict::Ignore);
        assert_eq!(s.classify("   "), Verdict::Ignore);
    }

    #[test]
    fn test_forward_normalizes() {
        let s = sanitizer();
        assert_eq!(s.classify("let x = 2 + 2"), forward("let x = 2 + 2;;"));
        assert_eq!(s.classify("let x = 2 + 2;;  \n"), forward("let x = 2 + 2;;"));
        assert_eq!(
            s.classify("/ml List.length [1; 2]"),
            forward("List.length [1; 2];;")
        );
        assert_eq!(
            s.classify("/ml@ocaml_bot 1 + 1"),
            forward("1 + 1;;")
        );
    }

    #[test]
    fn test_multiline_code_is_kept_whole() {
        let s = sanitizer();
        assert_eq!(
            s.classify("/ml let rec f n =\n  if n = 0 then 1\n  else n * f (n - 1)"),
            forward("let rec f n =\n  if n = 0 then 1\n  else n * f (n - 1);;")
        );
    }

    #[test]
    fn test_empty_terminator() {
        let s = Sanitizer::new(&SanitizerConfig::default(), "").unwrap();
        assert_eq!(s.classify("print 1"), forward("print 1"));
    }

    #[test]
    fn test_require_code_prefix() {
        let config = SanitizerConfig {
            require_code_prefix: true,
            ..SanitizerConfig::default()
        };
        let s = Sanitizer::new(&config, ";;").unwrap();
        assert_eq!(s.classify("1 + 1"), Verdict::Ignore);
        assert_eq!(s.classify("/ml 1 + 1"), forward("1 + 1;;"));
        assert!(!s.help_text().contains("Plain messages"));
    }

    #[test]
    fn test_denylist_rejects_hazards() {
        let s = sanitizer();
        let hazards = [
            ("Sys.command \"rm -rf /\"", "Sys"),
            ("sys", "sys"),
            ("Unix.fork ()", "Unix"),
            ("Stream.of_list []", "Stream"),
            ("let pid = fork ()", "fork"),
            ("execv \"/bin/sh\" [||]", "exec"),
            ("#cd \"/tmp\"", "#cd"),
            ("# directory \"/etc\"", "# directory"),
            ("#install_printer pp", "#install_printer"),
            ("Printf.fprintf stderr \"x\"", "fprintf"),
            ("input_file", "input_file"),
            ("output_file", "output_file"),
            ("let ic = open_in \"/etc/passwd\"", "open_in"),
            ("open_out \"x\"", "open_out"),
            ("#use \"topfind\"", "#use"),
            ("#load \"str.cma\"", "#load"),
            ("#mod_use \"a.ml\"", "#mod_use"),
        ];
        for (code, matched) in hazards {
            match s.classify(code) {
                Verdict::Reject(Rejection::Denylisted { matched: found, .. }) => {
                    assert_eq!(found, matched, "code {code:?}")
                }
                other => panic!("{code:?} was not rejected: {other:?}"),
            }
        }
    }

    #[test]
    fn test_denylist_scans_every_line() {
        let s = sanitizer();
        let verdict = s.classify("/ml let x = 1\nlet () = ignore (Sys.time ())");
        assert!(matches!(verdict, Verdict::Reject(Rejection::Denylisted { .. })));
    }

    #[test]
    fn test_safe_code_passes() {
        let s = sanitizer();
        let safe = [
            "let x = 2 + 2",
            "List.map (fun x -> x * 2) [1; 2; 3]",
            "type t = A | B of int",
            "print_endline \"hello\"",
            "String.concat \", \" [\"a\"; \"b\"]",
        ];
        for code in safe {
            assert!(
                matches!(s.classify(code), Verdict::Forward(_)),
                "{code:?} should be forwarded"
            );
        }
    }

    #[test]
    fn test_rejection_message() {
        let s = sanitizer();
        let Verdict::Reject(rejection) = s.classify("Sys.argv") else {
            panic!("expected rejection");
        };
        assert_eq!(
            rejection.to_string(),
            "Sorry, your code seems to contain a forbidden identifier: Sys"
        );
    }

    #[test]
    fn test_invalid_pattern_is_an_error() {
        let config = SanitizerConfig {
            denylist: vec!["(unclosed".to_string()],
            ..SanitizerConfig::default()
        };
        assert!(Sanitizer::new(&config, ";;").is_err());
    }
}
