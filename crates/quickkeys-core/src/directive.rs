use std::path::PathBuf;

const CLEAR_PREFIX: &str = "CLEAR::";
const CONFIG_PREFIX: &str = "config=";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    ReloadConfig,
    Shift,
    SwitchConfig(PathBuf),
    Run(String),
}

/// A binding string after prefix parsing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Directive {
    /// Held chord keys get their next release swallowed.
    pub clear: bool,
    /// `None` when nothing is left to do (e.g. a bare `CLEAR::`).
    pub action: Option<Action>,
}

/// Splits off a leading `CLEAR::`.
pub fn strip_clear(raw: &str) -> (bool, &str) {
    match raw.strip_prefix(CLEAR_PREFIX) {
        Some(rest) => (true, rest),
        None => (false, raw),
    }
}

impl Directive {
    pub fn parse(raw: &str) -> Self {
        let (clear, rest) = strip_clear(raw);

        let action = match rest {
            "" => None,
            "reload_config" => Some(Action::ReloadConfig),
            "shift" => Some(Action::Shift),
            other => match other.strip_prefix(CONFIG_PREFIX) {
                Some(path) => Some(Action::SwitchConfig(PathBuf::from(path))),
                None => Some(Action::Run(other.to_string())),
            },
        };

        Self { clear, action }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plain_command() {
        let d = Directive::parse("xdotool key ctrl+c");
        assert!(!d.clear);
        assert_eq!(d.action, Some(Action::Run("xdotool key ctrl+c".into())));
    }

    #[test]
    fn test_builtins() {
        assert_eq!(Directive::parse("shift").action, Some(Action::Shift));
        assert_eq!(
            Directive::parse("reload_config").action,
            Some(Action::ReloadConfig)
        );
        assert_eq!(
            Directive::parse("config=/tmp/alt.json").action,
            Some(Action::SwitchConfig(PathBuf::from("/tmp/alt.json")))
        );
    }

    #[test]
    fn test_clear_prefix_is_stripped() {
        let d = Directive::parse("CLEAR::echo hi");
        assert!(d.clear);
        assert_eq!(d.action, Some(Action::Run("echo hi".into())));

        let d = Directive::parse("CLEAR::shift");
        assert!(d.clear);
        assert_eq!(d.action, Some(Action::Shift));
    }

    #[test]
    fn test_bare_clear_has_no_action() {
        let d = Directive::parse("CLEAR::");
        assert!(d.clear);
        assert_eq!(d.action, None);
        assert_eq!(Directive::parse("").action, None);
    }

    #[test]
    fn test_prefix_only_matches_at_start() {
        let d = Directive::parse("echo CLEAR::");
        assert!(!d.clear);
        assert_eq!(d.action, Some(Action::Run("echo CLEAR::".into())));
    }
}
