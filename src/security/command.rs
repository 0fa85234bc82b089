//! Shell command inspection for the security gate.
//!
//! A command line is split into simple commands at unquoted control
//! operators (`;`, `&&`, `||`, `|`, `&`, newline), each one tokenized with
//! `shell-words`, and reduced to the executable that actually runs once
//! leading `VAR=value` assignments and transparent wrappers are removed.

use std::path::Path;

use thiserror::Error;

/// Executables that cannot reach the network whatever their arguments.
const LOCAL_COMMANDS: &[&str] = &[
    "ls", "pwd", "echo", "printf", "cat", "head", "tail", "wc", "sort", "uniq", "cut", "tr",
    "grep", "egrep", "fgrep", "diff", "cmp", "comm", "stat", "file", "date", "whoami", "id",
    "true", "false", "basename", "dirname", "realpath", "readlink", "touch", "mkdir", "rmdir",
    "cp", "mv", "rm", "ln", "du", "df", "tree", "which", "test", "[", "sleep", "seq", "tee",
    "nl", "fold", "column", "md5sum", "sha1sum", "sha256sum", "jq", "uname",
];

const REMOTE_FETCH: &[&str] = &[
    "curl", "wget", "nc", "ncat", "netcat", "socat", "telnet", "ssh", "scp", "sftp", "rsync",
    "ftp", "tftp", "nslookup", "dig", "host", "ping", "aria2c", "http", "https", "xh", "lynx",
    "w3m", "gh", "kubectl", "aws", "gcloud", "az",
];

const PACKAGE_MANAGERS: &[&str] = &[
    "pip", "pipx", "uv", "npm", "npx", "pnpm", "yarn", "bun", "apt", "apt-get", "yum", "dnf",
    "apk", "brew", "gem", "composer",
];

const RUNTIMES: &[&str] = &[
    "python", "node", "deno", "ruby", "perl", "php", "lua", "java", "Rscript", "osascript",
];

const SHELL_INDIRECTION: &[&str] = &[
    "sh", "bash", "zsh", "dash", "ksh", "fish", "eval", "exec", "source", ".", "xargs", "sudo",
    "su", "doas",
];

/// Tools that are only network-capable with specific subcommands.
const NETWORK_SUBCOMMANDS: &[(&str, &[&str])] = &[
    (
        "git",
        &["clone", "fetch", "pull", "push", "ls-remote", "remote", "submodule", "archive"],
    ),
    (
        "cargo",
        &["install", "fetch", "publish", "update", "add", "search", "login"],
    ),
    ("go", &["get", "install", "mod"]),
    ("docker", &["pull", "push", "run", "login", "build", "exec"]),
    ("podman", &["pull", "push", "run", "login", "build", "exec"]),
];

/// Wrappers that run the command given after their own options.
const WRAPPERS: &[&str] = &[
    "env", "nohup", "time", "command", "timeout", "nice", "busybox", "toybox", "stdbuf",
    "setsid", "ionice",
];

/// Wrappers that also count as a command of their own.
const VISIBLE_WRAPPERS: &[&str] = &["sudo", "doas", "xargs"];

/// Shell words that precede a command without running anything.
const RESERVED_WORDS: &[&str] = &[
    "!", "{", "}", "if", "then", "else", "elif", "fi", "do", "done", "while", "until", "esac",
    "coproc",
];

/// Compound headers whose words are not commands.
const HEADERS: &[&str] = &["for", "case", "select"];

/// `find` actions that run a command.
const FIND_EXEC: &[&str] = &["-exec", "-execdir", "-ok", "-okdir"];

#[derive(Debug, Clone, Error, PartialEq)]
pub enum CommandParseError {
    #[error("command is empty")]
    Empty,
    #[error("command cannot be parsed: {0}")]
    Malformed(String),
}

/// One simple command within a command line.
#[derive(Debug, Clone, PartialEq)]
pub struct Segment {
    /// Basename of the executable
    pub program: String,
    pub args: Vec<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ParsedCommand {
    pub segments: Vec<Segment>,
    /// Network-capable constructs found outside any simple command:
    /// substitution, unresolvable programs, socket redirections
    pub concerns: Vec<String>,
}

impl ParsedCommand {
    pub fn parse(command: &str) -> Result<Self, CommandParseError> {
        if command.trim().is_empty() {
            return Err(CommandParseError::Empty);
        }

        let (raw_segments, substitution) = split_control_operators(command)?;
        let mut segments = Vec::new();
        let mut concerns = Vec::new();
        if substitution {
            concerns.push("command substitution (shell indirection)".to_string());
        }
        for raw in raw_segments {
            let tokens =
                shell_words::split(&raw).map_err(|e| CommandParseError::Malformed(e.to_string()))?;
            if let Some(target) = tokens.iter().find(|t| is_socket_path(t)) {
                concerns.push(format!("`{target}` (network redirection)"));
            }
            extract_segments(&tokens, &mut segments, &mut concerns);
        }

        if segments.is_empty() && concerns.is_empty() {
            return Err(CommandParseError::Empty);
        }
        Ok(Self { segments, concerns })
    }

    /// True when every simple command is provably local.
    pub fn is_provably_local(&self) -> bool {
        self.concerns.is_empty()
            && self
                .segments
                .iter()
                .all(|s| LOCAL_COMMANDS.contains(&s.program.as_str()))
    }

    /// Describes the first network-capable pattern found, if any.
    pub fn network_pattern(&self) -> Option<String> {
        self.concerns
            .first()
            .cloned()
            .or_else(|| self.segments.iter().find_map(network_category))
    }
}

fn network_category(segment: &Segment) -> Option<String> {
    let program = segment.program.as_str();
    let family = program.trim_end_matches(|c: char| c.is_ascii_digit() || c == '.');
    let family = if family.is_empty() { program } else { family };

    let categories: [(&[&str], &str); 4] = [
        (REMOTE_FETCH, "remote fetch"),
        (PACKAGE_MANAGERS, "package install"),
        (RUNTIMES, "language runtime"),
        (SHELL_INDIRECTION, "shell indirection"),
    ];
    for (list, label) in categories {
        if list.contains(&program) || list.contains(&family) {
            return Some(format!("`{program}` ({label})"));
        }
    }

    let (_, subcommands) = NETWORK_SUBCOMMANDS.iter().find(|(tool, _)| *tool == program)?;
    let sub = first_positional(program, &segment.args)?;
    if subcommands.contains(&sub) {
        return Some(format!("`{program} {sub}` (network subcommand)"));
    }
    None
}

/// First non-option argument, skipping option values for tools whose
/// global options take one (`git -C dir`, `git -c key=value`).
fn first_positional<'a>(program: &str, args: &'a [String]) -> Option<&'a str> {
    let mut iter = args.iter();
    while let Some(arg) = iter.next() {
        if arg.starts_with('-') {
            if program == "git" && (arg == "-C" || arg == "-c") {
                iter.next();
            }
            continue;
        }
        return Some(arg.as_str());
    }
    None
}

/// Splits at unquoted control operators and subshell parentheses. Also
/// reports whether command or process substitution appears outside
/// single quotes.
fn split_control_operators(command: &str) -> Result<(Vec<String>, bool), CommandParseError> {
    let mut segments = Vec::new();
    let mut current = String::new();
    let mut substitution = false;
    let mut in_single = false;
    let mut in_double = false;
    let mut chars = command.chars().peekable();

    while let Some(c) = chars.next() {
        if in_single {
            current.push(c);
            if c == '\'' {
                in_single = false;
            }
            continue;
        }
        match c {
            '\\' => {
                current.push(c);
                if let Some(next) = chars.next() {
                    current.push(next);
                }
            }
            '\'' if !in_double => {
                in_single = true;
                current.push(c);
            }
            '"' => {
                in_double = !in_double;
                current.push(c);
            }
            '`' => {
                substitution = true;
                current.push(c);
            }
            '$' | '<' | '>' if chars.peek() == Some(&'(') && (c == '$' || !in_double) => {
                substitution = true;
                current.push(c);
                chars.next();
                current.push('(');
            }
            _ if in_double => current.push(c),
            ';' | '\n' | '|' | '(' | ')' => {
                segments.push(std::mem::take(&mut current));
            }
            '&' => {
                // `2>&1` and `&>file` are redirections, not operators
                let redirect = current.ends_with('>')
                    || current.ends_with('<')
                    || chars.peek() == Some(&'>');
                if redirect {
                    current.push(c);
                } else {
                    segments.push(std::mem::take(&mut current));
                }
            }
            _ => current.push(c),
        }
    }

    if in_single || in_double {
        return Err(CommandParseError::Malformed("unterminated quote".to_string()));
    }
    segments.push(current);
    Ok((
        segments.into_iter().filter(|s| !s.trim().is_empty()).collect(),
        substitution,
    ))
}

fn is_assignment(token: &str) -> bool {
    match token.split_once('=') {
        Some((name, _)) => {
            let mut chars = name.chars();
            matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
                && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
        }
        None => false,
    }
}

fn is_redirection(token: &str) -> bool {
    let rest = token.trim_start_matches(|c: char| c.is_ascii_digit() || c == '&');
    rest.starts_with('>') || rest.starts_with('<')
}

/// Bash opens a socket for redirections to these paths.
fn is_socket_path(token: &str) -> bool {
    token.contains("/dev/tcp/") || token.contains("/dev/udp/")
}

/// A program word the shell would rewrite before running it
/// (`$CMD`, `{curl,x}`, `cur?`).
fn is_resolvable(word: &str) -> bool {
    if word == "[" || word == "[[" {
        return true;
    }
    !word.contains(|c: char| matches!(c, '$' | '`' | '*' | '?' | '[' | '{' | '}' | '(' | ')'))
}

fn basename(token: &str) -> String {
    Path::new(token)
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or(token)
        .to_string()
}

/// Options of a wrapper that consume the following word.
fn wrapper_option_takes_value(program: &str, opt: &str) -> bool {
    match program {
        "env" => matches!(opt, "-u" | "-C" | "-S"),
        "timeout" => matches!(opt, "-s" | "-k"),
        "nice" => opt == "-n",
        "ionice" => matches!(opt, "-c" | "-n" | "-p"),
        "stdbuf" => matches!(opt, "-i" | "-o" | "-e"),
        "sudo" => matches!(opt, "-u" | "-g" | "-h" | "-p" | "-C" | "-D" | "-r" | "-t" | "-U"),
        "doas" => matches!(opt, "-u" | "-C"),
        "xargs" => matches!(opt, "-I" | "-n" | "-P" | "-d" | "-E" | "-L" | "-s" | "-a"),
        _ => false,
    }
}

/// Reduces one simple command to the executables it runs. Assignments,
/// redirections and reserved words are stripped, wrappers are looked
/// through, and `find -exec` actions are added as commands of their own.
fn extract_segments(tokens: &[String], segments: &mut Vec<Segment>, concerns: &mut Vec<String>) {
    let mut i = 0;

    loop {
        while let Some(token) = tokens.get(i) {
            let token = token.as_str();
            if is_redirection(token) {
                // A bare operator takes the following word as its target
                i += if token.ends_with(|c: char| matches!(c, '>' | '<' | '&' | '|')) { 2 } else { 1 };
            } else if token == "function" {
                i += 2;
            } else if is_assignment(token) || RESERVED_WORDS.contains(&token) {
                i += 1;
            } else {
                break;
            }
        }
        let Some(word) = tokens.get(i) else {
            return;
        };
        if HEADERS.contains(&word.as_str()) {
            return;
        }
        if !is_resolvable(word) {
            concerns.push(format!("`{word}` is not a plain executable (shell indirection)"));
            return;
        }

        let program = basename(word);
        let args = &tokens[i + 1..];
        let visible = VISIBLE_WRAPPERS.contains(&program.as_str());
        if visible || !WRAPPERS.contains(&program.as_str()) {
            if program == "find" {
                extract_find_actions(args, segments, concerns);
            }
            segments.push(Segment {
                program: program.clone(),
                args: args.to_vec(),
            });
            if !visible {
                return;
            }
        }

        i += 1;
        while let Some(opt) = tokens.get(i).filter(|t| t.starts_with('-')) {
            i += 1;
            if opt == "--" {
                break;
            }
            if program == "env" && (opt == "-S" || opt.starts_with("--split-string")) {
                concerns.push("`env -S` (shell indirection)".to_string());
            }
            if wrapper_option_takes_value(&program, opt) {
                i += 1;
            }
        }
        if program == "timeout" {
            // Duration operand
            i += 1;
        }
    }
}

fn extract_find_actions(args: &[String], segments: &mut Vec<Segment>, concerns: &mut Vec<String>) {
    let mut rest = args;
    while let Some(pos) = rest.iter().position(|a| FIND_EXEC.contains(&a.as_str())) {
        let action = &rest[pos + 1..];
        let end = action
            .iter()
            .position(|a| a == ";" || a == "+")
            .unwrap_or(action.len());
        extract_segments(&action[..end], segments, concerns);
        rest = &action[end..];
    }
}
