//! Replication-mode wire protocol client.
//!
//! A logical-replication session needs the `replication=database` startup
//! parameter, which ordinary client libraries do not expose, so this
//! module speaks the frontend/backend protocol directly over TCP:
//! startup, authentication (cleartext, MD5, SCRAM-SHA-256),
//! `CREATE_REPLICATION_SLOT`, and `START_REPLICATION` into CopyBoth mode.
//! Message encoding and decoding is delegated to `postgres-protocol`.

use std::time::Duration;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use postgres_protocol::authentication::{md5_hash, sasl};
use postgres_protocol::message::{backend, frontend};
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_postgres::types::PgLsn;
use tracing::{debug, info, trace};

use crate::{Error, Result};

/// Connection to PostgreSQL in replication mode, before streaming starts.
pub struct ReplicationClient {
    stream: BufReader<TcpStream>,
}

impl ReplicationClient {
    /// Connects and authenticates with `replication=database` so the
    /// session accepts replication commands.
    pub async fn connect(
        host: &str,
        port: u16,
        user: &str,
        password: Option<&str>,
        database: &str,
    ) -> Result<Self> {
        debug!(host, port, user, database, "opening replication connection");

        let stream = TcpStream::connect((host, port)).await?;
        let mut stream = BufReader::new(stream);

        let params = vec![
            ("user", user),
            ("database", database),
            ("replication", "database"),
            ("application_name", "librarian"),
        ];
        let mut buf = BytesMut::new();
        frontend::startup_message(params.into_iter(), &mut buf)
            .map_err(|e| Error::Protocol(format!("encoding startup message: {e}")))?;
        stream.write_all(&buf).await?;
        stream.flush().await?;

        authenticate(&mut stream, user, password).await?;

        // Drain ParameterStatus/BackendKeyData until ReadyForQuery.
        loop {
            let (type_code, _body) = read_message(&mut stream).await?;
            match type_code {
                b'Z' => break,
                b'E' => {
                    return Err(Error::Connection(
                        "server rejected replication connection".to_string(),
                    ))
                }
                _ => {}
            }
        }

        info!(host, port, database, "replication connection established");
        Ok(Self { stream })
    }

    /// Creates a non-temporary logical slot with the given output plugin.
    pub async fn create_replication_slot(&mut self, slot: &str, plugin: &str) -> Result<()> {
        let query = format!("CREATE_REPLICATION_SLOT {slot} LOGICAL {plugin}");
        self.simple_query(&query).await?;
        info!(slot, plugin, "created replication slot");
        Ok(())
    }

    /// Issues `START_REPLICATION` and enters CopyBoth mode.
    pub async fn start_replication(
        mut self,
        slot: &str,
        start_lsn: PgLsn,
        publication: &str,
    ) -> Result<ReplicationStream> {
        let query = format!(
            "START_REPLICATION SLOT {slot} LOGICAL {start_lsn} \
             (proto_version '1', publication_names '{publication}')"
        );

        let mut buf = BytesMut::new();
        frontend::query(&query, &mut buf)
            .map_err(|e| Error::Protocol(format!("encoding START_REPLICATION: {e}")))?;
        self.stream.write_all(&buf).await?;
        self.stream.flush().await?;

        let (type_code, _body) = read_message(&mut self.stream).await?;
        match type_code {
            // CopyBothResponse
            b'W' => {
                info!(slot, %start_lsn, publication, "entered CopyBoth mode");
                Ok(ReplicationStream {
                    stream: self.stream,
                })
            }
            b'E' => Err(Error::Protocol(format!(
                "START_REPLICATION rejected for slot {slot}"
            ))),
            other => Err(Error::Protocol(format!(
                "unexpected response to START_REPLICATION: {}",
                other as char
            ))),
        }
    }

    async fn simple_query(&mut self, query: &str) -> Result<()> {
        let mut buf = BytesMut::new();
        frontend::query(query, &mut buf)
            .map_err(|e| Error::Protocol(format!("encoding query: {e}")))?;
        self.stream.write_all(&buf).await?;
        self.stream.flush().await?;

        let mut failed = false;
        loop {
            let (type_code, _body) = read_message(&mut self.stream).await?;
            match type_code {
                b'Z' => break,
                b'E' => failed = true,
                _ => {}
            }
        }
        if failed {
            return Err(Error::Protocol(format!("server rejected: {query}")));
        }
        Ok(())
    }
}

/// Active CopyBoth stream carrying WAL data and standby status updates.
pub struct ReplicationStream {
    stream: BufReader<TcpStream>,
}

impl ReplicationStream {
    /// Receives one CopyData payload.
    ///
    /// Returns [`Error::NoEventsFound`] when `deadline` expires before any
    /// data arrives (a cooperative yield, not an error), and `Ok(None)`
    /// when the server ends the copy stream. The deadline applies only to
    /// the first byte of a frame, so an expiry can never split a frame.
    pub async fn recv(&mut self, deadline: Duration) -> Result<Option<Bytes>> {
        let type_code = match timeout(deadline, self.stream.read_u8()).await {
            Ok(Ok(type_code)) => type_code,
            Ok(Err(e)) => return Err(Error::Io(e)),
            Err(_) => return Err(Error::NoEventsFound),
        };

        let len = self.stream.read_i32().await? as usize;
        if len < 4 {
            return Err(Error::Protocol(format!("invalid frame length: {len}")));
        }
        let mut body = vec![0u8; len - 4];
        self.stream.read_exact(&mut body).await?;

        match type_code {
            // CopyData
            b'd' => Ok(Some(Bytes::from(body))),
            // CopyDone
            b'c' => Ok(None),
            b'E' => Err(Error::Protocol(
                "error response on replication stream".to_string(),
            )),
            other => {
                trace!(type_code = %(other as char), "ignoring message on replication stream");
                Err(Error::NoEventsFound)
            }
        }
    }

    /// Sends a standby status update reporting the written, flushed, and
    /// applied WAL positions.
    pub async fn send_standby_status(
        &mut self,
        write: PgLsn,
        flush: PgLsn,
        apply: PgLsn,
    ) -> Result<()> {
        let mut payload = BytesMut::with_capacity(34);
        payload.put_u8(b'r');
        payload.put_u64(write.into());
        payload.put_u64(flush.into());
        payload.put_u64(apply.into());
        payload.put_i64(pg_timestamp_micros());
        payload.put_u8(0);

        let mut frame = BytesMut::with_capacity(1 + 4 + payload.len());
        frame.put_u8(b'd');
        frame.put_i32((payload.len() + 4) as i32);
        frame.put_slice(&payload);

        self.stream.write_all(&frame).await?;
        self.stream.flush().await?;

        trace!(%write, %flush, %apply, "sent standby status update");
        Ok(())
    }

    pub async fn close(self) -> Result<()> {
        let mut inner = self.stream.into_inner();
        inner.shutdown().await.ok();
        Ok(())
    }
}

/// A server keepalive parsed from a CopyData payload tagged `k`.
#[derive(Debug, Clone, Copy)]
pub struct PrimaryKeepalive {
    pub wal_end: u64,
    pub reply_requested: bool,
}

impl PrimaryKeepalive {
    pub fn parse(mut data: &[u8]) -> Result<Self> {
        if data.remaining() < 17 {
            return Err(Error::InvalidMessage {
                message: format!("keepalive too short: {} bytes", data.remaining()),
            });
        }
        let wal_end = data.get_u64();
        let _server_time = data.get_i64();
        let reply_requested = data.get_u8() != 0;
        Ok(Self {
            wal_end,
            reply_requested,
        })
    }
}

async fn authenticate(
    stream: &mut BufReader<TcpStream>,
    user: &str,
    password: Option<&str>,
) -> Result<()> {
    let mut scram: Option<sasl::ScramSha256> = None;

    loop {
        let (type_code, body) = read_message(stream).await?;

        let mut raw = BytesMut::with_capacity(1 + 4 + body.len());
        raw.put_u8(type_code);
        raw.put_i32((body.len() + 4) as i32);
        raw.put_slice(&body);
        let message = backend::Message::parse(&mut raw)
            .map_err(Error::Io)?
            .ok_or_else(|| Error::Protocol("truncated authentication message".to_string()))?;

        match message {
            backend::Message::AuthenticationOk => {
                debug!(user, "authentication successful");
                return Ok(());
            }

            backend::Message::AuthenticationCleartextPassword => {
                let password = require_password(password)?;
                let mut buf = BytesMut::new();
                frontend::password_message(password.as_bytes(), &mut buf).map_err(Error::Io)?;
                stream.write_all(&buf).await?;
                stream.flush().await?;
            }

            backend::Message::AuthenticationMd5Password(body) => {
                let password = require_password(password)?;
                let hashed = md5_hash(user.as_bytes(), password.as_bytes(), body.salt());
                let mut buf = BytesMut::new();
                frontend::password_message(hashed.as_bytes(), &mut buf).map_err(Error::Io)?;
                stream.write_all(&buf).await?;
                stream.flush().await?;
            }

            backend::Message::AuthenticationSasl(_) => {
                let password = require_password(password)?;
                let mechanism = sasl::ScramSha256::new(
                    password.as_bytes(),
                    sasl::ChannelBinding::unsupported(),
                );
                let mut buf = BytesMut::new();
                frontend::sasl_initial_response(sasl::SCRAM_SHA_256, mechanism.message(), &mut buf)
                    .map_err(Error::Io)?;
                stream.write_all(&buf).await?;
                stream.flush().await?;
                scram = Some(mechanism);
            }

            backend::Message::AuthenticationSaslContinue(body) => {
                let mechanism = scram.as_mut().ok_or_else(|| {
                    Error::Protocol("SASL continuation before SASL start".to_string())
                })?;
                mechanism.update(body.data()).map_err(Error::Io)?;
                let mut buf = BytesMut::new();
                frontend::sasl_response(mechanism.message(), &mut buf).map_err(Error::Io)?;
                stream.write_all(&buf).await?;
                stream.flush().await?;
            }

            backend::Message::AuthenticationSaslFinal(body) => {
                let mut mechanism = scram.take().ok_or_else(|| {
                    Error::Protocol("SASL final before SASL start".to_string())
                })?;
                mechanism.finish(body.data()).map_err(Error::Io)?;
            }

            backend::Message::ErrorResponse(_) => {
                return Err(Error::Connection(format!(
                    "authentication failed for user {user}"
                )));
            }

            _ => {
                return Err(Error::Protocol(format!(
                    "unexpected message during authentication: {}",
                    type_code as char
                )));
            }
        }
    }
}

fn require_password(password: Option<&str>) -> Result<&str> {
    password.ok_or_else(|| {
        Error::Connection("server requested a password but none was supplied".to_string())
    })
}

async fn read_message(stream: &mut BufReader<TcpStream>) -> Result<(u8, Vec<u8>)> {
    let type_code = stream.read_u8().await?;
    let len = stream.read_i32().await? as usize;
    if len < 4 {
        return Err(Error::Protocol(format!("invalid message length: {len}")));
    }
    let mut body = vec![0u8; len - 4];
    stream.read_exact(&mut body).await?;
    Ok((type_code, body))
}

/// Microseconds since the PostgreSQL epoch (2000-01-01 00:00:00 UTC).
fn pg_timestamp_micros() -> i64 {
    const PG_EPOCH_UNIX_MICROS: i64 = 946_684_800_000_000;
    chrono::Utc::now().timestamp_micros() - PG_EPOCH_UNIX_MICROS
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keepalive_parses() {
        let mut buf = BytesMut::new();
        buf.put_u64(0x16B3748);
        buf.put_i64(794_801_234_567);
        buf.put_u8(1);

        let keepalive = PrimaryKeepalive::parse(&buf).unwrap();
        assert_eq!(keepalive.wal_end, 0x16B3748);
        assert!(keepalive.reply_requested);
    }

    #[test]
    fn keepalive_rejects_short_payload() {
        assert!(PrimaryKeepalive::parse(&[0u8; 5]).is_err());
    }

    #[test]
    fn pg_epoch_is_after_unix_epoch() {
        assert!(pg_timestamp_micros() > 0);
    }
}
