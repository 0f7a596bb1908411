//! Replication-mode connection.
//!
//! tokio-postgres cannot enter CopyBoth mode, so the streaming plane speaks the
//! frontend/backend protocol directly with `postgres-protocol`. The startup
//! packet carries `replication=database`, which lets the walsender accept
//! `START_REPLICATION` for a logical slot.

use std::io;
use std::time::Duration;

use byteorder::{BigEndian, ByteOrder};
use bytes::BytesMut;
use fallible_iterator::FallibleIterator;
use postgres_protocol::authentication::{self, sasl};
use postgres_protocol::message::backend::{ErrorResponseBody, Message};
use postgres_protocol::message::frontend;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_postgres::tls::{MakeTlsConnect, TlsConnect};
use tokio_postgres_rustls_improved::MakeRustlsConnect;
use tracing::{debug, info};
use walcast_core::format_lsn;

use super::envelope::{encode_standby_status, StatusUpdate};
use super::transport::{RecvError, ReplicationTransport, WireMessage};
use crate::connect::{tls_connector, ConnectionTarget};
use crate::error::{PgError, PgResult};

const READ_CHUNK: usize = 8 * 1024;

/// CopyBothResponse, which `Message::parse` does not recognise.
const COPY_BOTH_RESPONSE_TAG: u8 = b'W';

/// A backend message as seen by the replication connection.
enum Backend {
    CopyBoth,
    Message(Message),
}

trait Socket: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> Socket for T {}

/// A connection opened with `replication=database`.
pub struct ReplicationConnection {
    stream: Box<dyn Socket>,
    read_buf: BytesMut,
    write_buf: BytesMut,
    streaming: bool,
}

impl std::fmt::Debug for ReplicationConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReplicationConnection")
            .field("streaming", &self.streaming)
            .finish_non_exhaustive()
    }
}

impl ReplicationConnection {
    /// Connect and authenticate. Returns once the server is ready for queries.
    pub async fn connect(target: &ConnectionTarget) -> PgResult<Self> {
        tokio::time::timeout(target.connect_timeout, Self::open(target))
            .await
            .map_err(|_| {
                PgError::Connection(format!(
                    "timed out after {:?} connecting to {}:{}",
                    target.connect_timeout, target.host, target.port
                ))
            })?
    }

    async fn open(target: &ConnectionTarget) -> PgResult<Self> {
        let tcp = TcpStream::connect((target.host.as_str(), target.port))
            .await
            .map_err(|e| {
                PgError::Connection(format!("{}:{}: {}", target.host, target.port, e))
            })?;
        tcp.set_nodelay(true)?;

        let stream: Box<dyn Socket> = if target.tls {
            negotiate_tls(tcp, &target.host).await?
        } else {
            Box::new(tcp)
        };

        let mut conn = Self::with_stream(stream);
        conn.startup(target).await?;

        info!(
            host = %target.host,
            port = target.port,
            database = %target.database,
            "Opened replication connection"
        );

        Ok(conn)
    }

    fn with_stream(stream: Box<dyn Socket>) -> Self {
        Self {
            stream,
            read_buf: BytesMut::with_capacity(READ_CHUNK),
            write_buf: BytesMut::new(),
            streaming: false,
        }
    }

    async fn startup(&mut self, target: &ConnectionTarget) -> PgResult<()> {
        let params = [
            ("user", target.user.as_str()),
            ("database", target.database.as_str()),
            ("replication", "database"),
            ("application_name", target.application_name.as_str()),
            ("client_encoding", "UTF8"),
        ];
        frontend::startup_message(params.iter().copied(), &mut self.write_buf)?;
        self.flush().await?;

        loop {
            match self.read_message().await? {
                Message::AuthenticationOk => debug!("Authenticated"),
                Message::AuthenticationCleartextPassword => {
                    let password = password(target)?;
                    frontend::password_message(password, &mut self.write_buf)?;
                    self.flush().await?;
                }
                Message::AuthenticationMd5Password(body) => {
                    let password = password(target)?;
                    let hash =
                        authentication::md5_hash(target.user.as_bytes(), password, body.salt());
                    frontend::password_message(hash.as_bytes(), &mut self.write_buf)?;
                    self.flush().await?;
                }
                Message::AuthenticationSasl(body) => {
                    let mut supports_scram = false;
                    let mut mechanisms = body.mechanisms();
                    while let Some(mechanism) = mechanisms.next()? {
                        if mechanism == sasl::SCRAM_SHA_256 {
                            supports_scram = true;
                        }
                    }
                    if !supports_scram {
                        return Err(PgError::Authentication(
                            "server offered no supported SASL mechanism".into(),
                        ));
                    }
                    self.scram(password(target)?).await?;
                }
                Message::ErrorResponse(body) => {
                    return Err(PgError::Authentication(error_message(&body)));
                }
                Message::ReadyForQuery(_) => return Ok(()),
                // ParameterStatus, BackendKeyData, NoticeResponse
                _ => {}
            }
        }
    }

    async fn scram(&mut self, password: &[u8]) -> PgResult<()> {
        let mut scram = sasl::ScramSha256::new(password, sasl::ChannelBinding::unsupported());

        frontend::sasl_initial_response(sasl::SCRAM_SHA_256, scram.message(), &mut self.write_buf)?;
        self.flush().await?;

        match self.read_message().await? {
            Message::AuthenticationSaslContinue(body) => scram.update(body.data())?,
            Message::ErrorResponse(body) => {
                return Err(PgError::Authentication(error_message(&body)))
            }
            _ => return Err(PgError::Authentication("unexpected SASL message".into())),
        }

        frontend::sasl_response(scram.message(), &mut self.write_buf)?;
        self.flush().await?;

        match self.read_message().await? {
            Message::AuthenticationSaslFinal(body) => scram.finish(body.data())?,
            Message::ErrorResponse(body) => {
                return Err(PgError::Authentication(error_message(&body)))
            }
            _ => return Err(PgError::Authentication("unexpected SASL message".into())),
        }

        Ok(())
    }

    /// Next message outside CopyBoth negotiation; a stray CopyBothResponse is
    /// a protocol error.
    async fn read_message(&mut self) -> io::Result<Message> {
        match self.read_backend().await? {
            Backend::Message(message) => Ok(message),
            Backend::CopyBoth => Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "unexpected CopyBothResponse",
            )),
        }
    }

    async fn read_backend(&mut self) -> io::Result<Backend> {
        loop {
            if let Some(backend) = self.parse_backend()? {
                return Ok(backend);
            }

            self.read_buf.reserve(READ_CHUNK);
            if self.stream.read_buf(&mut self.read_buf).await? == 0 {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "server closed the connection",
                ));
            }
        }
    }

    fn parse_backend(&mut self) -> io::Result<Option<Backend>> {
        if self.read_buf.first() != Some(&COPY_BOTH_RESPONSE_TAG) {
            return Ok(Message::parse(&mut self.read_buf)?.map(Backend::Message));
        }

        if self.read_buf.len() < 5 {
            return Ok(None);
        }
        let len = BigEndian::read_i32(&self.read_buf[1..5]);
        if len < 4 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("invalid CopyBothResponse length {}", len),
            ));
        }

        let frame_len = len as usize + 1;
        if self.read_buf.len() < frame_len {
            return Ok(None);
        }
        // Column formats are irrelevant: replication CopyData is always binary.
        let _ = self.read_buf.split_to(frame_len);
        Ok(Some(Backend::CopyBoth))
    }

    async fn flush(&mut self) -> io::Result<()> {
        self.stream.write_all(&self.write_buf).await?;
        self.write_buf.clear();
        self.stream.flush().await
    }

    async fn start(
        &mut self,
        slot_name: &str,
        start_lsn: u64,
        plugin_options: &[(String, String)],
    ) -> PgResult<()> {
        let command = start_replication_command(slot_name, start_lsn, plugin_options);
        debug!(command = %command, "Starting replication");

        frontend::query(&command, &mut self.write_buf)?;
        self.flush().await?;

        loop {
            match self.read_backend().await? {
                Backend::CopyBoth => {
                    self.streaming = true;
                    info!(
                        slot = %slot_name,
                        start_lsn = %format_lsn(start_lsn),
                        "Replication stream started"
                    );
                    return Ok(());
                }
                Backend::Message(Message::ErrorResponse(body)) => {
                    return Err(PgError::StartReplication(error_message(&body)));
                }
                // NoticeResponse, ParameterStatus
                Backend::Message(_) => {}
            }
        }
    }

    async fn receive(&mut self, timeout: Duration) -> Result<WireMessage, RecvError> {
        let message = match tokio::time::timeout(timeout, self.read_message()).await {
            Err(_) => return Err(RecvError::Timeout),
            Ok(Err(e)) => return Err(RecvError::from_io(&e)),
            Ok(Ok(message)) => message,
        };

        match message {
            Message::CopyData(body) => Ok(WireMessage::CopyData(body.into_bytes())),
            Message::CopyDone => {
                self.streaming = false;
                Err(RecvError::Fatal("server ended the replication stream".into()))
            }
            Message::ErrorResponse(body) => Err(RecvError::Fatal(error_message(&body))),
            _ => Ok(WireMessage::Other),
        }
    }

    async fn status(&mut self, update: StatusUpdate) -> PgResult<()> {
        frontend::CopyData::new(encode_standby_status(&update))?.write(&mut self.write_buf);
        self.flush().await?;
        Ok(())
    }

    async fn shutdown(&mut self) -> PgResult<()> {
        if self.streaming {
            frontend::copy_done(&mut self.write_buf);
            self.streaming = false;
        }
        frontend::terminate(&mut self.write_buf);
        self.flush().await?;
        self.stream.shutdown().await?;
        debug!("Closed replication connection");
        Ok(())
    }
}

impl ReplicationTransport for ReplicationConnection {
    fn start_replication(
        &mut self,
        slot_name: &str,
        start_lsn: u64,
        plugin_options: &[(String, String)],
    ) -> impl std::future::Future<Output = PgResult<()>> + Send {
        self.start(slot_name, start_lsn, plugin_options)
    }

    fn recv(
        &mut self,
        timeout: Duration,
    ) -> impl std::future::Future<Output = Result<WireMessage, RecvError>> + Send {
        self.receive(timeout)
    }

    fn send_status(
        &mut self,
        update: StatusUpdate,
    ) -> impl std::future::Future<Output = PgResult<()>> + Send {
        self.status(update)
    }

    fn close(&mut self) -> impl std::future::Future<Output = PgResult<()>> + Send {
        self.shutdown()
    }
}

async fn negotiate_tls(mut tcp: TcpStream, host: &str) -> PgResult<Box<dyn Socket>> {
    let mut buf = BytesMut::new();
    frontend::ssl_request(&mut buf);
    tcp.write_all(&buf).await?;

    let mut answer = [0u8; 1];
    tcp.read_exact(&mut answer).await?;
    if answer[0] != b'S' {
        return Err(PgError::Connection("server does not accept TLS".into()));
    }

    let mut maker: MakeRustlsConnect = tls_connector()?;
    let connector = <MakeRustlsConnect as MakeTlsConnect<TcpStream>>::make_tls_connect(
        &mut maker, host,
    )
    .map_err(|e| PgError::Connection(format!("TLS setup failed: {}", boxed(e))))?;

    let stream = connector
        .connect(tcp)
        .await
        .map_err(|e| PgError::Connection(format!("TLS handshake failed: {}", boxed(e))))?;

    Ok(Box::new(stream))
}

fn boxed<E>(e: E) -> Box<dyn std::error::Error + Send + Sync>
where
    E: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    e.into()
}

fn password(target: &ConnectionTarget) -> PgResult<&[u8]> {
    target
        .password
        .as_deref()
        .ok_or_else(|| PgError::Authentication("server requested a password".into()))
}

/// `START_REPLICATION SLOT "name" LOGICAL X/Y ("k" 'v', ...)`
pub fn start_replication_command(
    slot_name: &str,
    start_lsn: u64,
    plugin_options: &[(String, String)],
) -> String {
    let mut command = format!(
        "START_REPLICATION SLOT \"{}\" LOGICAL {}",
        slot_name,
        format_lsn(start_lsn)
    );

    if !plugin_options.is_empty() {
        let options: Vec<String> = plugin_options
            .iter()
            .map(|(key, value)| format!("\"{}\" '{}'", key, value.replace('\'', "''")))
            .collect();
        command.push_str(" (");
        command.push_str(&options.join(", "));
        command.push(')');
    }

    command
}

fn error_message(body: &ErrorResponseBody) -> String {
    let mut severity = None;
    let mut code = None;
    let mut message = None;

    let mut fields = body.fields();
    while let Ok(Some(field)) = fields.next() {
        match field.type_() {
            b'S' => severity = Some(field.value().to_string()),
            b'C' => code = Some(field.value().to_string()),
            b'M' => message = Some(field.value().to_string()),
            _ => {}
        }
    }

    format!(
        "{}: {} (code: {})",
        severity.as_deref().unwrap_or("ERROR"),
        message.as_deref().unwrap_or("unknown error"),
        code.as_deref().unwrap_or("?????")
    )
}
