use regex::Regex;

/// How far a loop body extends after its header.
#[derive(Debug, Clone, Copy)]
enum BodyEnd {
    /// Shell loops end at the first `done`.
    ShellDone,
    /// Indentation-scoped bodies are scanned to the end of the text.
    EndOfText,
}

#[derive(Debug, Clone)]
struct LoopRule {
    name: &'static str,
    header: Regex,
    body_end: BodyEnd,
}

#[derive(Debug, Clone)]
struct InlineRule {
    name: &'static str,
    pattern: Regex,
}

/// One dangerous construct found in hook content.
#[derive(Debug, Clone, PartialEq)]
pub struct ContentFinding {
    pub rule: &'static str,
    pub description: String,
    pub excerpt: String,
}

/// Detects unbounded loops that re-invoke an agent entry point.
#[derive(Debug, Clone)]
pub struct ContentScanner {
    commands: Vec<String>,
    command: Option<Regex>,
    shell_done: Option<Regex>,
    loops: Vec<LoopRule>,
    inline: Vec<InlineRule>,
}

const EXCERPT_CHARS: usize = 120;

fn compile(name: &str, pattern: &str) -> Option<Regex> {
    match Regex::new(pattern) {
        Ok(re) => Some(re),
        Err(e) => {
            log::error!("Skipping content rule {}: {}", name, e);
            None
        }
    }
}

fn excerpt(text: &str) -> String {
    let flat = text.split_whitespace().collect::<Vec<_>>().join(" ");
    if flat.chars().count() > EXCERPT_CHARS {
        let cut: String = flat.chars().take(EXCERPT_CHARS).collect();
        format!("{}...", cut)
    } else {
        flat
    }
}

impl ContentScanner {
    pub fn new(commands: &[String]) -> Self {
        let commands: Vec<String> = commands
            .iter()
            .map(|c| c.trim().to_string())
            .filter(|c| !c.is_empty())
            .collect();

        if commands.is_empty() {
            return Self {
                commands,
                command: None,
                shell_done: None,
                loops: Vec::new(),
                inline: Vec::new(),
            };
        }

        let alternation = commands
            .iter()
            .map(|c| regex::escape(c))
            .collect::<Vec<_>>()
            .join("|");

        let loop_specs: [(&'static str, &str, BodyEnd); 4] = [
            (
                "infinite_while",
                r"\bwhile\s+(?:true|:|\[\s*1\s*\]|\[\[\s*1\s*\]\]|\(\(\s*1\s*\)\))\s*(?:;|\n)\s*do\b",
                BodyEnd::ShellDone,
            ),
            (
                "infinite_until",
                r"\buntil\s+false\s*(?:;|\n)\s*do\b",
                BodyEnd::ShellDone,
            ),
            (
                "infinite_for",
                r"\bfor\s*\(\(\s*;\s*;\s*\)\)\s*(?:;|\n)?\s*do\b",
                BodyEnd::ShellDone,
            ),
            ("python_while_true", r"\bwhile\s+True\s*:", BodyEnd::EndOfText),
        ];

        let loops = loop_specs
            .iter()
            .filter_map(|(name, pattern, body_end)| {
                compile(name, pattern).map(|header| LoopRule {
                    name: *name,
                    header,
                    body_end: *body_end,
                })
            })
            .collect();

        let inline_specs: [(&'static str, String); 2] = [
            ("yes_pipe", format!(r"\byes\b[^\n|]*\|\s*(?:{})\b", alternation)),
            (
                "watch_reinvoke",
                format!(r"\bwatch\b[^\n|;]*?\b(?:{})\b", alternation),
            ),
        ];

        let inline = inline_specs
            .iter()
            .filter_map(|(name, pattern)| {
                compile(name, pattern).map(|pattern| InlineRule {
                    name: *name,
                    pattern,
                })
            })
            .collect();

        Self {
            command: compile("self_invocation", &format!(r"\b(?:{})\b", alternation)),
            shell_done: compile("shell_done", r"\bdone\b"),
            commands,
            loops,
            inline,
        }
    }

    pub fn commands(&self) -> &[String] {
        &self.commands
    }

    pub fn scan(&self, text: &str) -> Vec<ContentFinding> {
        let Some(command) = &self.command else {
            return Vec::new();
        };
        let mut findings = Vec::new();

        for rule in &self.loops {
            for header in rule.header.find_iter(text) {
                let rest = &text[header.end()..];
                let body = match (rule.body_end, &self.shell_done) {
                    (BodyEnd::ShellDone, Some(done)) => match done.find(rest) {
                        Some(end) => &rest[..end.start()],
                        None => rest,
                    },
                    _ => rest,
                };
                if let Some(call) = command.find(body) {
                    findings.push(ContentFinding {
                        rule: rule.name,
                        description: format!(
                            "unbounded loop re-invokes `{}`",
                            call.as_str()
                        ),
                        excerpt: excerpt(&text[header.start()..header.end() + call.end()]),
                    });
                }
            }
        }

        for rule in &self.inline {
            for found in rule.pattern.find_iter(text) {
                let invoked = command
                    .find(found.as_str())
                    .map(|m| m.as_str().to_string())
                    .unwrap_or_default();
                findings.push(ContentFinding {
                    rule: rule.name,
                    description: format!("repeating driver re-invokes `{}`", invoked),
                    excerpt: excerpt(found.as_str()),
                });
            }
        }

        findings
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scanner() -> ContentScanner {
        ContentScanner::new(&["claude".to_string(), "nova".to_string()])
    }

    #[test]
    fn test_detects_shell_while_true() {
        let findings = scanner().scan("#!/bin/bash\nwhile true; do\n  claude --continue\ndone\n");
        assert_eq!(findings.len(), 1);
        assert_eq!(findings[0].rule, "infinite_while");
        assert!(findings[0].description.contains("claude"));
    }

    #[test]
    fn test_detects_variants() {
        let s = scanner();
        assert!(!s.scan("while :; do nova run; done").is_empty());
        assert!(!s.scan("for ((;;)); do nova; done").is_empty());
        assert!(!s.scan("until false; do claude; done").is_empty());
        assert!(!s.scan("while True:\n    subprocess.run(['claude'])").is_empty());
        assert!(!s.scan("yes | claude").is_empty());
    }

    #[test]
    fn test_ignores_bounded_or_unrelated_loops() {
        let s = scanner();
        assert!(s.scan("for i in 1 2 3; do claude; done").is_empty());
        assert!(s.scan("while true; do echo tick; sleep 1; done").is_empty());
        assert!(s.scan("while true; do echo; done\nclaude --once").is_empty());
    }

    #[test]
    fn test_no_commands_means_no_findings() {
        let s = ContentScanner::new(&[]);
        assert!(s.scan("while true; do claude; done").is_empty());
    }
}
