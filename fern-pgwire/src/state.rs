// SPDX-FileCopyrightText:  Copyright © 2022 The Fern Authors <team@fernproxy.io>
// SPDX-License-Identifier: Apache-2.0

use fern_protocol_postgresql::codec::frontend::Parameter;

/// Protocol state of a client connection.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ConnectionState {
    /// Nothing received yet, or an encryption request was just declined.
    AwaitingStartup,

    /// An `SSLRequest` or `GSSENCRequest` is being answered.
    AwaitingSslDecision,

    /// A `StartupMessage` is being processed.
    AwaitingStartupParameters,

    /// A `PasswordMessage` is expected.
    Authenticating,

    Ready,

    /// Discarding messages until the next `Sync`, after a failed command.
    ErrorSkip,

    Closed,
}

impl ConnectionState {
    /// Whether the connection went through the startup sequence.
    pub fn is_established(self) -> bool {
        matches!(self, Self::Ready | Self::ErrorSkip)
    }
}

/// Connection parameters sent by the client in its `StartupMessage`.
///
/// Order of the parameters is preserved, and parameters with an empty
/// name or value are left out.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct StartupProperties {
    properties: Vec<(String, String)>,
}

impl StartupProperties {
    pub fn from_parameters(parameters: &[Parameter]) -> Self {
        let properties = parameters
            .iter()
            .filter(|p| !p.name.is_empty() && !p.value.is_empty())
            .map(|p| {
                (
                    String::from_utf8_lossy(&p.name).into_owned(),
                    String::from_utf8_lossy(&p.value).into_owned(),
                )
            })
            .collect();

        Self { properties }
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.properties
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.as_str())
    }

    pub fn user(&self) -> Option<&str> {
        self.get("user")
    }

    /// Requested database, defaulting to the user name as Postgres does.
    pub fn database(&self) -> Option<&str> {
        self.get("database").or_else(|| self.user())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.properties.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.properties.len()
    }

    pub fn is_empty(&self) -> bool {
        self.properties.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    #[test]
    fn empty_names_and_values_are_left_out() {
        let properties = StartupProperties::from_parameters(&[
            Parameter::new("user", "alice"),
            Parameter::new("application_name", ""),
            Parameter::new("", "orphan"),
            Parameter::new("database", "fern"),
        ]);

        assert_eq!(2, properties.len());
        assert_eq!(
            vec![("user", "alice"), ("database", "fern")],
            properties.iter().collect::<Vec<_>>()
        );
        assert_eq!(None, properties.get("application_name"));
    }

    #[test]
    fn database_defaults_to_user() {
        let properties = StartupProperties::from_parameters(&[Parameter::new("user", "alice")]);

        assert_eq!(Some("alice"), properties.user());
        assert_eq!(Some("alice"), properties.database());
    }

    #[test]
    fn missing_user() {
        let properties = StartupProperties::from_parameters(&[]);

        assert!(properties.is_empty());
        assert_eq!(None, properties.user());
        assert_eq!(None, properties.database());
    }
}
