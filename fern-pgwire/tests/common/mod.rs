// SPDX-FileCopyrightText:  Copyright © 2022 The Fern Authors <team@fernproxy.io>
// SPDX-License-Identifier: Apache-2.0

#![allow(dead_code)]

use async_trait::async_trait;
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{DuplexStream, ReadHalf, WriteHalf};
use tokio::task::JoinHandle;
use tokio_util::codec::{FramedRead, FramedWrite};

use fern_pgwire::{Connection, Engine, Error};
use fern_pgwire_interfaces::{
    ConnectionProperties, DataType, DescribeResult, FormatCode, RowSource, ServerContext, Session,
    SessionError, SessionFactory, TargetKind, User, Value,
};
use fern_protocol_postgresql::codec::backend::{self, ErrorField};
use fern_protocol_postgresql::codec::frontend::{self, Parameter};
use fern_session_embedded::{EmbeddedAuthentication, EmbeddedSessionFactory};

const TIMEOUT: Duration = Duration::from_secs(5);

/// Builds an engine from TOML settings, as a server would.
pub fn engine(settings: &str) -> Arc<Engine> {
    let config = config::Config::builder()
        .add_source(config::File::from_str(settings, config::FileFormat::Toml))
        .build()
        .unwrap();
    let context = ServerContext::new(config);

    Arc::new(Engine::new(
        Arc::new(EmbeddedAuthentication::new(&context)),
        Arc::new(EmbeddedSessionFactory::new(&context)),
    ))
}

/// Portals bound through an engine, in order.
pub type BoundPortals = Arc<Mutex<Vec<String>>>;

/// Builds a `trust` engine whose sessions record every portal they bind.
pub fn engine_recording_binds() -> (Arc<Engine>, BoundPortals) {
    let bound = BoundPortals::default();
    let sessions = RecordingFactory {
        inner: EmbeddedSessionFactory::default(),
        bound: Arc::clone(&bound),
    };
    let engine = Engine::new(
        Arc::new(EmbeddedAuthentication::new(&ServerContext::new(config::Config::default()))),
        Arc::new(sessions),
    );
    (Arc::new(engine), bound)
}

struct RecordingFactory {
    inner: EmbeddedSessionFactory,
    bound: BoundPortals,
}

#[async_trait]
impl SessionFactory for RecordingFactory {
    async fn create_session(&self, database: Option<&str>, user: &User) -> Result<Box<dyn Session>, SessionError> {
        let inner = self.inner.create_session(database, user).await?;
        Ok(Box::new(RecordingSession {
            inner,
            bound: Arc::clone(&self.bound),
        }))
    }
}

/// Forwards everything to an embedded session, noting successful binds.
struct RecordingSession {
    inner: Box<dyn Session>,
    bound: BoundPortals,
}

#[async_trait]
impl Session for RecordingSession {
    async fn parse(&mut self, name: &str, query: &str, param_types: Vec<DataType>) -> Result<(), SessionError> {
        self.inner.parse(name, query, param_types).await
    }

    async fn bind(
        &mut self,
        portal: &str,
        statement: &str,
        params: Vec<Value>,
        result_formats: Vec<FormatCode>,
    ) -> Result<(), SessionError> {
        self.inner.bind(portal, statement, params, result_formats).await?;
        self.bound.lock().unwrap().push(portal.to_string());
        Ok(())
    }

    async fn describe(&mut self, target: TargetKind, name: &str) -> Result<DescribeResult, SessionError> {
        self.inner.describe(target, name).await
    }

    async fn execute(&mut self, portal: &str, max_rows: u32) -> Result<RowSource, SessionError> {
        self.inner.execute(portal, max_rows).await
    }

    async fn execute_simple(&mut self, query: &str) -> Result<RowSource, SessionError> {
        self.inner.execute_simple(query).await
    }

    fn get_query(&self, portal: &str) -> Result<String, SessionError> {
        self.inner.get_query(portal)
    }

    fn get_param_type(&self, statement: &str, index: usize) -> Result<DataType, SessionError> {
        self.inner.get_param_type(statement, index)
    }

    fn get_result_format_codes(&self, portal: &str) -> Result<Vec<FormatCode>, SessionError> {
        self.inner.get_result_format_codes(portal)
    }

    async fn sync(&mut self) -> Result<(), SessionError> {
        self.inner.sync().await
    }

    fn clear_state(&mut self) {
        self.inner.clear_state()
    }

    fn close_target(&mut self, target: TargetKind, name: &str) {
        self.inner.close_target(target, name)
    }

    fn close(&mut self) {
        self.inner.close()
    }
}

/// A PostgreSQL client talking to an engine through an in-memory stream.
pub struct TestClient {
    stream: FramedRead<ReadHalf<DuplexStream>, backend::Codec>,
    sink: FramedWrite<WriteHalf<DuplexStream>, frontend::Codec>,
    server: JoinHandle<Result<(), Error>>,
}

impl TestClient {
    pub fn connect(engine: &Arc<Engine>) -> TestClient {
        Self::connect_from(engine, ConnectionProperties::new(None))
    }

    pub fn connect_from(engine: &Arc<Engine>, properties: ConnectionProperties) -> TestClient {
        let (client, server) = tokio::io::duplex(64 * 1024);
        let server = tokio::spawn(Connection::new(server, properties, Arc::clone(engine)).run());

        let (reader, writer) = tokio::io::split(client);
        TestClient {
            stream: FramedRead::new(reader, backend::Codec::new()),
            sink: FramedWrite::new(writer, frontend::Codec::new()),
            server,
        }
    }

    /// Connects and goes through a `trust` startup sequence.
    pub async fn ready(engine: &Arc<Engine>) -> TestClient {
        let mut client = Self::connect(engine);
        client.send(startup("alice")).await;
        let messages = client.recv_until_ready().await;
        assert_eq!(Some(&backend::Message::AuthenticationOk()), messages.first());
        client
    }

    pub async fn send(&mut self, msg: frontend::Message) {
        self.sink.send(msg).await.unwrap();
    }

    /// Sends `messages` in a single write.
    pub async fn send_all(&mut self, messages: Vec<frontend::Message>) {
        for msg in messages {
            self.sink.feed(msg).await.unwrap();
        }
        self.sink.flush().await.unwrap();
    }

    /// Sends raw bytes, bypassing the codec.
    pub async fn send_raw(&mut self, data: &[u8]) {
        use tokio::io::AsyncWriteExt;
        self.sink.get_mut().write_all(data).await.unwrap();
    }

    pub fn expect_encryption_response(&mut self) {
        self.stream.decoder_mut().expect_encryption_response();
    }

    pub async fn recv(&mut self) -> backend::Message {
        tokio::time::timeout(TIMEOUT, self.stream.next())
            .await
            .expect("timed out awaiting a message")
            .expect("connection closed")
            .unwrap()
    }

    /// Collects messages up to, and including, `ReadyForQuery`.
    pub async fn recv_until_ready(&mut self) -> Vec<backend::Message> {
        let mut messages = Vec::new();
        loop {
            let msg = self.recv().await;
            let ready = matches!(msg, backend::Message::ReadyForQuery(_));
            messages.push(msg);
            if ready {
                return messages;
            }
        }
    }

    /// Checks the server closed the connection, without sending anything more.
    pub async fn assert_closed(mut self) {
        let next = tokio::time::timeout(TIMEOUT, self.stream.next())
            .await
            .expect("timed out awaiting connection close");
        assert!(next.is_none(), "unexpected message: {:?}", next);

        tokio::time::timeout(TIMEOUT, self.server)
            .await
            .expect("timed out awaiting connection task")
            .unwrap()
            .unwrap();
    }
}

pub fn startup(user: &str) -> frontend::Message {
    frontend::Message::startup(vec![
        Parameter::new("user", user),
        Parameter::new("database", "fern"),
        Parameter::new("application_name", "tests"),
    ])
}

pub fn query(sql: &str) -> frontend::Message {
    frontend::Message::Query(Bytes::copy_from_slice(sql.as_bytes()))
}

pub fn parse(name: &str, sql: &str, param_types: Vec<u32>) -> frontend::Message {
    frontend::Message::Parse {
        name: Bytes::copy_from_slice(name.as_bytes()),
        query: Bytes::copy_from_slice(sql.as_bytes()),
        param_types,
    }
}

pub fn bind(portal: &str, statement: &str, param_formats: Vec<i16>, parameters: Vec<Option<&str>>) -> frontend::Message {
    frontend::Message::Bind {
        portal: Bytes::copy_from_slice(portal.as_bytes()),
        stmt_name: Bytes::copy_from_slice(statement.as_bytes()),
        param_formats,
        parameters: parameters
            .into_iter()
            .map(|p| p.map(|p| Bytes::copy_from_slice(p.as_bytes())))
            .collect(),
        results_formats: vec![],
    }
}

pub fn describe(target: u8, name: &str) -> frontend::Message {
    frontend::Message::Describe {
        target,
        name: Bytes::copy_from_slice(name.as_bytes()),
    }
}

pub fn execute(portal: &str) -> frontend::Message {
    frontend::Message::Execute {
        portal: Bytes::copy_from_slice(portal.as_bytes()),
        max_rows: 0,
    }
}

pub fn close(target: u8, name: &str) -> frontend::Message {
    frontend::Message::Close {
        target,
        name: Bytes::copy_from_slice(name.as_bytes()),
    }
}

pub fn data_row(fields: &[Option<&str>]) -> backend::Message {
    backend::Message::DataRow(
        fields
            .iter()
            .map(|f| f.map(|f| Bytes::copy_from_slice(f.as_bytes())))
            .collect(),
    )
}

pub fn command_complete(tag: &str) -> backend::Message {
    backend::Message::CommandComplete(Bytes::copy_from_slice(tag.as_bytes()))
}

/// Returns the value of field `code` of an `ErrorResponse`.
pub fn error_field(msg: &backend::Message, code: u8) -> Option<String> {
    match msg {
        backend::Message::ErrorResponse(fields) => fields
            .iter()
            .find(|ErrorField { code: c, .. }| *c == code)
            .map(|field| String::from_utf8_lossy(&field.value).into_owned()),
        _ => None,
    }
}

/// Asserts `msg` is an `ErrorResponse` with `severity` and `sql_state`.
pub fn assert_error(msg: &backend::Message, severity: &str, sql_state: &str) {
    assert_eq!(Some(severity.to_string()), error_field(msg, b'S'), "{:?}", msg);
    assert_eq!(Some(sql_state.to_string()), error_field(msg, b'C'), "{:?}", msg);
}

pub fn ready_for_query() -> backend::Message {
    backend::Message::ReadyForQuery(b'I')
}
