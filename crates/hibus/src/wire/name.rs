//! Endpoint, method and bubble names.

use std::fmt;
use std::str::FromStr;

pub const MAX_HOST_NAME_LEN: usize = 127;
pub const MAX_APP_NAME_LEN: usize = 127;
pub const MAX_RUNNER_NAME_LEN: usize = 63;
/// Upper bound for method and bubble names.
pub const MAX_TOKEN_NAME_LEN: usize = 63;

pub const LOCALHOST: &str = "localhost";
pub const BUILTIN_APP_NAME: &str = "cn.fmsoft.hybridos.hibus";
pub const BUILTIN_RUNNER_NAME: &str = "builtin";

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum NameError {
    #[error("endpoint name must start with '@': {0:?}")]
    MissingAt(String),
    #[error("endpoint name must have the form @host/app/runner: {0:?}")]
    Malformed(String),
    #[error("{kind} name is empty")]
    Empty { kind: &'static str },
    #[error("{kind} name exceeds {max} bytes")]
    TooLong { kind: &'static str, max: usize },
    #[error("{kind} name contains invalid character {ch:?}")]
    InvalidChar { kind: &'static str, ch: char },
}

/// Globally unique endpoint identity, rendered as `@host/app/runner`.
///
/// Ordering is host, then app, then runner; registry enumeration relies on it.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct EndpointName {
    host: String,
    app: String,
    runner: String,
}

impl EndpointName {
    pub fn new(
        host: impl Into<String>,
        app: impl Into<String>,
        runner: impl Into<String>,
    ) -> Result<Self, NameError> {
        let name = Self {
            host: host.into(),
            app: app.into(),
            runner: runner.into(),
        };
        check_component("host", &name.host, MAX_HOST_NAME_LEN, |c| c == ':')?;
        check_component("app", &name.app, MAX_APP_NAME_LEN, |_| false)?;
        check_component("runner", &name.runner, MAX_RUNNER_NAME_LEN, |_| false)?;
        Ok(name)
    }

    /// The broker's own endpoint.
    pub fn builtin() -> Self {
        Self {
            host: LOCALHOST.to_string(),
            app: BUILTIN_APP_NAME.to_string(),
            runner: BUILTIN_RUNNER_NAME.to_string(),
        }
    }

    pub fn is_builtin(&self) -> bool {
        self.host == LOCALHOST && self.app == BUILTIN_APP_NAME && self.runner == BUILTIN_RUNNER_NAME
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn app(&self) -> &str {
        &self.app
    }

    pub fn runner(&self) -> &str {
        &self.runner
    }
}

impl fmt::Display for EndpointName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "@{}/{}/{}", self.host, self.app, self.runner)
    }
}

impl FromStr for EndpointName {
    type Err = NameError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let rest = s
            .strip_prefix('@')
            .ok_or_else(|| NameError::MissingAt(s.to_string()))?;
        let mut parts = rest.splitn(3, '/');
        match (parts.next(), parts.next(), parts.next()) {
            (Some(host), Some(app), Some(runner)) => Self::new(host, app, runner),
            _ => Err(NameError::Malformed(s.to_string())),
        }
    }
}

fn check_component(
    kind: &'static str,
    value: &str,
    max: usize,
    extra: impl Fn(char) -> bool,
) -> Result<(), NameError> {
    if value.is_empty() {
        return Err(NameError::Empty { kind });
    }
    if value.len() > max {
        return Err(NameError::TooLong { kind, max });
    }
    if let Some(ch) = value
        .chars()
        .find(|&c| !(c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_') || extra(c)))
    {
        return Err(NameError::InvalidChar { kind, ch });
    }
    Ok(())
}

/// Validates a method or bubble name: 1 to 63 characters of `[A-Za-z0-9_]`.
pub fn validate_token(kind: &'static str, value: &str) -> Result<(), NameError> {
    if value.is_empty() {
        return Err(NameError::Empty { kind });
    }
    if value.len() > MAX_TOKEN_NAME_LEN {
        return Err(NameError::TooLong {
            kind,
            max: MAX_TOKEN_NAME_LEN,
        });
    }
    if let Some(ch) = value
        .chars()
        .find(|&c| !(c.is_ascii_alphanumeric() || c == '_'))
    {
        return Err(NameError::InvalidChar { kind, ch });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_and_parse_agree() {
        let name = EndpointName::new("localhost", "cn.example.app", "main").unwrap();
        assert_eq!(name.to_string(), "@localhost/cn.example.app/main");

        let parsed: EndpointName = "@localhost/cn.example.app/main".parse().unwrap();
        assert_eq!(parsed, name);
    }

    #[test]
    fn builtin_name() {
        let builtin = EndpointName::builtin();
        assert!(builtin.is_builtin());
        assert_eq!(
            builtin.to_string(),
            "@localhost/cn.fmsoft.hybridos.hibus/builtin"
        );
    }

    #[test]
    fn parse_rejects_bad_shapes() {
        assert!(matches!(
            "localhost/app/runner".parse::<EndpointName>(),
            Err(NameError::MissingAt(_))
        ));
        assert!(matches!(
            "@localhost/app".parse::<EndpointName>(),
            Err(NameError::Malformed(_))
        ));
        assert!(matches!(
            "@localhost/app/run/ner".parse::<EndpointName>(),
            Err(NameError::InvalidChar { kind: "runner", ch: '/' })
        ));
        assert!(matches!(
            "@localhost//runner".parse::<EndpointName>(),
            Err(NameError::Empty { kind: "app" })
        ));
    }

    #[test]
    fn component_lengths_are_bounded() {
        let runner = "r".repeat(MAX_RUNNER_NAME_LEN + 1);
        assert_eq!(
            EndpointName::new("localhost", "app", runner),
            Err(NameError::TooLong {
                kind: "runner",
                max: MAX_RUNNER_NAME_LEN
            })
        );
        assert!(EndpointName::new("localhost", "a".repeat(MAX_APP_NAME_LEN), "r").is_ok());
    }

    #[test]
    fn hosts_may_be_ip_addresses() {
        assert!(EndpointName::new("192.168.1.7", "app", "main").is_ok());
        assert!(EndpointName::new("::1", "app", "main").is_ok());
        assert!(EndpointName::new("local host", "app", "main").is_err());
    }

    #[test]
    fn ordering_is_host_app_runner() {
        let mut names = vec![
            EndpointName::new("localhost", "b", "a").unwrap(),
            EndpointName::new("localhost", "a", "z").unwrap(),
            EndpointName::new("localhost", "a", "b").unwrap(),
        ];
        names.sort();
        let rendered: Vec<_> = names.iter().map(ToString::to_string).collect();
        assert_eq!(
            rendered,
            ["@localhost/a/b", "@localhost/a/z", "@localhost/b/a"]
        );
    }

    #[test]
    fn token_names() {
        assert!(validate_token("method", "echo_2").is_ok());
        assert_eq!(
            validate_token("method", ""),
            Err(NameError::Empty { kind: "method" })
        );
        assert_eq!(
            validate_token("bubble", "new-data"),
            Err(NameError::InvalidChar {
                kind: "bubble",
                ch: '-'
            })
        );
        assert!(validate_token("bubble", &"x".repeat(64)).is_err());
    }
}
