// SPDX-FileCopyrightText:  Copyright © 2022 The Fern Authors <team@fernproxy.io>
// SPDX-License-Identifier: Apache-2.0

//! Per-connection registry of prepared statements and portals.
//!
//! A registry is owned by a single [`Session`](crate::Session), and is never
//! shared between connections.

use std::collections::HashMap;
use std::sync::Arc;

use crate::{DataType, FormatCode, SessionError, Value};

/// A parsed query, along with its declared parameter types.
#[derive(Debug, PartialEq)]
pub struct PreparedStatement {
    pub name: String,
    pub query: String,
    pub param_types: Vec<DataType>,
}

/// A prepared statement bound to parameter values, ready to be executed.
#[derive(Debug)]
pub struct Portal {
    pub name: String,
    pub statement: Arc<PreparedStatement>,
    pub params: Vec<Value>,
    pub result_formats: Vec<FormatCode>,
}

#[derive(Debug, Default)]
pub struct StatementRegistry {
    statements: HashMap<String, Arc<PreparedStatement>>,
    portals: HashMap<String, Portal>,
}

impl StatementRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores `statement`, replacing any statement with the same name.
    ///
    /// Portals bound from a replaced statement keep a reference to it,
    /// and stay executable.
    pub fn put_statement(&mut self, statement: PreparedStatement) -> Arc<PreparedStatement> {
        let statement = Arc::new(statement);
        if let Some(previous) = self
            .statements
            .insert(statement.name.clone(), statement.clone())
        {
            log::trace!("replaced prepared statement: {:?}", previous.name);
        }
        statement
    }

    pub fn statement(&self, name: &str) -> Result<&Arc<PreparedStatement>, SessionError> {
        self.statements
            .get(name)
            .ok_or_else(|| SessionError::UnknownStatement(name.to_string()))
    }

    /// Stores `portal`, replacing any portal with the same name.
    pub fn put_portal(&mut self, portal: Portal) {
        self.portals.insert(portal.name.clone(), portal);
    }

    pub fn portal(&self, name: &str) -> Result<&Portal, SessionError> {
        self.portals
            .get(name)
            .ok_or_else(|| SessionError::UnknownPortal(name.to_string()))
    }

    /// Removes a statement and every portal bound from it.
    ///
    /// Returns `false` if no such statement existed.
    pub fn close_statement(&mut self, name: &str) -> bool {
        match self.statements.remove(name) {
            None => false,
            Some(statement) => {
                self.portals
                    .retain(|_, portal| !Arc::ptr_eq(&portal.statement, &statement));
                true
            }
        }
    }

    /// Removes a portal, returning `false` if no such portal existed.
    pub fn close_portal(&mut self, name: &str) -> bool {
        self.portals.remove(name).is_some()
    }

    /// Drops the unnamed statement and every portal.
    pub fn clear_transient(&mut self) {
        self.statements.remove("");
        self.portals.clear();
    }

    /// Drops everything.
    pub fn clear(&mut self) {
        self.statements.clear();
        self.portals.clear();
    }
}
