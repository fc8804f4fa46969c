//! Connection Establishment
//!
//! Opens a TCP stream to the first reachable address and prepares the
//! session before any command is multiplexed over it:
//!
//! ```text
//! connect ──> AUTH [username] password   (if credentials are configured)
//!         ──> SELECT db                  (if database_id != 0)
//!         ──> CLIENT SETNAME name        (if client_name is set)
//! ```
//!
//! Each step is a strict request/reply round trip. The whole attempt for one
//! address is bounded by `connection_timeout`.

use crate::config::{ConnectionRequest, NodeAddress};
use crate::connection::error::ConnectError;
use crate::protocol::{encode_command, ReplyDecoder, RespValue};
use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, trace};

/// Connects to the first address that accepts the connection and the handshake.
pub async fn connect(request: &ConnectionRequest) -> Result<TcpStream, ConnectError> {
    let mut last_error = None;

    for address in &request.addresses {
        match connect_to(address, request).await {
            Ok(stream) => {
                debug!(address = %address, "Connected");
                return Ok(stream);
            }
            Err(e) => {
                debug!(address = %address, error = %e, "Connection attempt failed");
                last_error = Some(e);
            }
        }
    }

    Err(last_error.unwrap_or(ConnectError::NoAddresses))
}

async fn connect_to(
    address: &NodeAddress,
    request: &ConnectionRequest,
) -> Result<TcpStream, ConnectError> {
    let timeout = request.connection_timeout();

    let attempt = async {
        let mut stream = TcpStream::connect((address.host.as_str(), address.port))
            .await
            .map_err(|source| ConnectError::Io {
                address: address.to_string(),
                source,
            })?;
        stream.set_nodelay(true)?;
        handshake(&mut stream, request).await?;
        Ok(stream)
    };

    match tokio::time::timeout(timeout, attempt).await {
        Ok(result) => result,
        Err(_) => Err(ConnectError::Timeout {
            address: address.to_string(),
            timeout_ms: timeout.as_millis() as u64,
        }),
    }
}

/// Runs the session setup commands on a freshly opened stream.
pub async fn handshake<S>(stream: &mut S, request: &ConnectionRequest) -> Result<(), ConnectError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut buffer = BytesMut::with_capacity(256);

    if let Some(auth) = &request.authentication_info {
        let mut args = vec![Bytes::from_static(b"AUTH")];
        if let Some(username) = &auth.username {
            args.push(Bytes::from(username.clone()));
        }
        args.push(Bytes::from(auth.password.clone()));

        match round_trip(stream, &mut buffer, &args).await? {
            RespValue::Error(e) => return Err(ConnectError::Authentication(e)),
            reply => expect_ok("AUTH", reply)?,
        }
    }

    if request.database_id != 0 {
        let args = [
            Bytes::from_static(b"SELECT"),
            Bytes::from(request.database_id.to_string()),
        ];
        let reply = round_trip(stream, &mut buffer, &args).await?;
        expect_ok("SELECT", reply)?;
    }

    if let Some(name) = &request.client_name {
        let args = [
            Bytes::from_static(b"CLIENT"),
            Bytes::from_static(b"SETNAME"),
            Bytes::from(name.clone()),
        ];
        let reply = round_trip(stream, &mut buffer, &args).await?;
        expect_ok("CLIENT SETNAME", reply)?;
    }

    Ok(())
}

fn expect_ok(command: &str, reply: RespValue) -> Result<(), ConnectError> {
    if reply.is_ok() {
        Ok(())
    } else {
        Err(ConnectError::Handshake(format!(
            "unexpected reply to {}: {}",
            command, reply
        )))
    }
}

async fn round_trip<S>(
    stream: &mut S,
    buffer: &mut BytesMut,
    args: &[Bytes],
) -> Result<RespValue, ConnectError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    stream.write_all(&encode_command(args)).await?;
    stream.flush().await?;

    let decoder = ReplyDecoder::new();
    loop {
        if let Some(reply) = decoder.decode(buffer)? {
            trace!(reply = %reply, "Handshake reply");
            return Ok(reply);
        }
        if stream.read_buf(buffer).await? == 0 {
            return Err(ConnectError::Closed);
        }
    }
}
