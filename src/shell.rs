//! Shell line construction for commands run inside a sandbox.

use std::fmt;
use std::sync::LazyLock;

use regex::Regex;

/// Anything outside the word characters forces quoting.
static NON_WORD: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[^A-Za-z0-9_]").expect("static regex"));

/// One element of an argument list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Arg {
    /// Plain text, single-quoted when it contains a non-word character.
    Literal(String),
    /// Inserted into the line as-is, e.g. `&&` or `|`.
    Raw(String),
}

impl Arg {
    pub fn raw(s: impl Into<String>) -> Self {
        Arg::Raw(s.into())
    }

    /// Render this argument the way it appears in the joined line.
    ///
    /// Quoting is verbatim: embedded single quotes are not escaped. Callers that
    /// need a literal `'` must build the fragment themselves with [`Arg::Raw`].
    pub fn render(&self) -> String {
        match self {
            Arg::Literal(s) if NON_WORD.is_match(s) => format!("'{}'", s),
            Arg::Literal(s) => s.clone(),
            Arg::Raw(s) => s.clone(),
        }
    }
}

impl From<&str> for Arg {
    fn from(s: &str) -> Self {
        Arg::Literal(s.to_string())
    }
}

impl From<String> for Arg {
    fn from(s: String) -> Self {
        Arg::Literal(s)
    }
}

impl From<&String> for Arg {
    fn from(s: &String) -> Self {
        Arg::Literal(s.clone())
    }
}

/// What to run inside the sandbox.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandLine {
    /// A complete shell script, used verbatim.
    Script(String),
    /// An argument list joined with [`join_args`].
    Args(Vec<Arg>),
}

impl CommandLine {
    pub fn args<I, A>(args: I) -> Self
    where
        I: IntoIterator<Item = A>,
        A: Into<Arg>,
    {
        CommandLine::Args(args.into_iter().map(Into::into).collect())
    }

    /// The script text handed to `bash` inside the sandbox.
    pub fn to_script(&self) -> String {
        match self {
            CommandLine::Script(s) => s.clone(),
            CommandLine::Args(args) => join_args(args),
        }
    }
}

impl fmt::Display for CommandLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_script())
    }
}

impl From<&str> for CommandLine {
    fn from(s: &str) -> Self {
        CommandLine::Script(s.to_string())
    }
}

impl From<Vec<Arg>> for CommandLine {
    fn from(args: Vec<Arg>) -> Self {
        CommandLine::Args(args)
    }
}

/// Join arguments into a single shell line.
pub fn join_args(args: &[Arg]) -> String {
    args.iter().map(Arg::render).collect::<Vec<_>>().join(" ")
}

/// Quote each element for log output: `'a' 'b c'`.
pub fn display_argv<S: AsRef<str>>(argv: &[S]) -> String {
    argv.iter()
        .map(|s| format!("'{}'", s.as_ref()))
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plain_words_pass_through() {
        assert_eq!(Arg::from("ps").render(), "ps");
        assert_eq!(Arg::from("fauwwwx").render(), "fauwwwx");
        assert_eq!(Arg::from("snake_case_42").render(), "snake_case_42");
    }

    #[test]
    fn test_non_word_chars_are_quoted() {
        assert_eq!(Arg::from("foo bar").render(), "'foo bar'");
        assert_eq!(Arg::from("/etc/udev").render(), "'/etc/udev'");
        assert_eq!(Arg::from("0666").render(), "0666");
        assert_eq!(Arg::from("-f").render(), "'-f'");
        assert_eq!(Arg::from("$HOME").render(), "'$HOME'");
    }

    #[test]
    fn test_quoting_is_verbatim() {
        // No escaping of embedded quotes.
        assert_eq!(Arg::from("it's").render(), "'it's'");
    }

    #[test]
    fn test_raw_is_never_quoted() {
        assert_eq!(Arg::raw("&&").render(), "&&");
        assert_eq!(Arg::raw("> /dev/null").render(), "> /dev/null");
    }

    #[test]
    fn test_join_mixed_line() {
        let line = join_args(&[
            Arg::from("ps"),
            Arg::from("foo bar"),
            Arg::raw("&&"),
            Arg::from("echo"),
            Arg::from("done"),
        ]);
        assert_eq!(line, "ps 'foo bar' && echo done");
    }

    #[test]
    fn test_empty_literal_is_an_empty_token() {
        assert_eq!(join_args(&[Arg::from("a"), Arg::from(""), Arg::from("b")]), "a  b");
    }

    #[test]
    fn test_script_is_verbatim() {
        let line = CommandLine::from("echo 'x' | wc -c");
        assert_eq!(line.to_script(), "echo 'x' | wc -c");
    }

    #[test]
    fn test_command_line_args_constructor() {
        let line = CommandLine::args(["echo", "hello world"]);
        assert_eq!(line.to_script(), "echo 'hello world'");
    }

    #[test]
    fn test_display_argv() {
        assert_eq!(display_argv(&["docker", "stop", "a b"]), "'docker' 'stop' 'a b'");
    }
}
