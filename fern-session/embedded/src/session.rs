// SPDX-FileCopyrightText:  Copyright © 2022 The Fern Authors <team@fernproxy.io>
// SPDX-License-Identifier: Apache-2.0

use async_trait::async_trait;

use fern_pgwire_interfaces::registry::{Portal, PreparedStatement, StatementRegistry};
use fern_pgwire_interfaces::{
    DataType, DescribeResult, FormatCode, RowSource, ServerContext, Session, SessionError,
    SessionFactory, TargetKind, User, Value,
};

use crate::query::Statement;

/// Creates [`EmbeddedSession`]s.
///
/// Databases clients may connect to are listed in `session.databases`;
/// when not set, any database name is accepted.
#[derive(Debug, Default)]
pub struct EmbeddedSessionFactory {
    databases: Vec<String>,
}

impl EmbeddedSessionFactory {
    pub fn new(context: &ServerContext) -> Self {
        let mut databases = vec![];
        if let Ok(names) = context.config.get::<Vec<String>>("session.databases") {
            databases = names;
        }
        Self { databases }
    }
}

#[async_trait]
impl SessionFactory for EmbeddedSessionFactory {
    async fn create_session(
        &self,
        database: Option<&str>,
        user: &User,
    ) -> Result<Box<dyn Session>, SessionError> {
        let database = database.unwrap_or(&user.name);
        if !self.databases.is_empty() && !self.databases.iter().any(|name| name == database) {
            return Err(SessionError::Execution {
                sql_state: "3D000".to_string(),
                message: format!("database \"{}\" does not exist", database),
            });
        }

        log::info!("opening session for {:?} on database {:?}", user.name, database);
        Ok(Box::new(EmbeddedSession::new(&user.name, database)))
    }
}

/// A [`Session`] answering the embedded SQL dialect, without any storage.
#[derive(Debug)]
pub struct EmbeddedSession {
    user: String,
    database: String,
    registry: StatementRegistry,
}

impl EmbeddedSession {
    pub fn new(user: &str, database: &str) -> Self {
        Self {
            user: user.to_string(),
            database: database.to_string(),
            registry: StatementRegistry::new(),
        }
    }

    /// Declared parameter types, completed with `Unknown` up to the
    /// number of parameters the statement references.
    fn param_types(statement: &PreparedStatement) -> Result<Vec<DataType>, SessionError> {
        let referenced = Statement::parse(&statement.query)?.param_count();
        let mut types = statement.param_types.clone();
        if types.len() < referenced {
            types.resize(referenced, DataType::Unknown);
        }
        Ok(types)
    }
}

#[async_trait]
impl Session for EmbeddedSession {
    async fn parse(
        &mut self,
        name: &str,
        query: &str,
        param_types: Vec<DataType>,
    ) -> Result<(), SessionError> {
        // Statements are analysed again when used, this only rejects invalid ones early.
        Statement::parse(query)?;

        self.registry.put_statement(PreparedStatement {
            name: name.to_string(),
            query: query.to_string(),
            param_types,
        });
        Ok(())
    }

    async fn bind(
        &mut self,
        portal: &str,
        statement: &str,
        params: Vec<Value>,
        result_formats: Vec<FormatCode>,
    ) -> Result<(), SessionError> {
        let statement = self.registry.statement(statement)?.clone();
        let required = Self::param_types(&statement)?.len();
        if params.len() != required {
            return Err(SessionError::ParameterCount {
                statement: statement.name.clone(),
                supplied: params.len(),
                required,
            });
        }

        self.registry.put_portal(Portal {
            name: portal.to_string(),
            statement,
            params,
            result_formats,
        });
        Ok(())
    }

    async fn describe(
        &mut self,
        target: TargetKind,
        name: &str,
    ) -> Result<DescribeResult, SessionError> {
        let statement = match target {
            TargetKind::Statement => self.registry.statement(name)?,
            TargetKind::Portal => &self.registry.portal(name)?.statement,
        };

        // Parameters of unknown type are inferred as text.
        let parameters: Vec<_> = Self::param_types(statement)?
            .into_iter()
            .map(|data_type| match data_type {
                DataType::Unknown => DataType::Text,
                data_type => data_type,
            })
            .collect();
        let fields = Statement::parse(&statement.query)?.fields(&parameters);

        Ok(DescribeResult { parameters, fields })
    }

    async fn execute(&mut self, portal: &str, max_rows: u32) -> Result<RowSource, SessionError> {
        let portal = self.registry.portal(portal)?;
        let param_types = Self::param_types(&portal.statement)?;

        Statement::parse(&portal.statement.query)?
            .execute(&portal.params, &param_types, max_rows as usize)
            .await
    }

    async fn execute_simple(&mut self, query: &str) -> Result<RowSource, SessionError> {
        Statement::parse(query)?.execute(&[], &[], 0).await
    }

    fn get_query(&self, portal: &str) -> Result<String, SessionError> {
        Ok(self.registry.portal(portal)?.statement.query.clone())
    }

    fn get_param_type(&self, statement: &str, index: usize) -> Result<DataType, SessionError> {
        let statement = self.registry.statement(statement)?;
        Self::param_types(statement)?
            .get(index)
            .copied()
            .ok_or_else(|| SessionError::ParameterIndex {
                statement: statement.name.clone(),
                index,
            })
    }

    fn get_result_format_codes(&self, portal: &str) -> Result<Vec<FormatCode>, SessionError> {
        Ok(self.registry.portal(portal)?.result_formats.clone())
    }

    async fn sync(&mut self) -> Result<(), SessionError> {
        Ok(())
    }

    fn clear_state(&mut self) {
        self.registry.clear_transient();
    }

    fn close_target(&mut self, target: TargetKind, name: &str) {
        let closed = match target {
            TargetKind::Statement => self.registry.close_statement(name),
            TargetKind::Portal => self.registry.close_portal(name),
        };
        log::trace!("close {} {:?}: {}", target, name, closed);
    }

    fn close(&mut self) {
        log::info!("closing session for {:?} on database {:?}", self.user, self.database);
        self.registry.clear();
    }
}
