use bytes::Bytes;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

const RECORD_V1: u8 = 1;
pub const AUTH_OK: &[u8] = b"ok";

pub const MAX_AUTH_BYTES: u32 = 64 << 10; // 64 KiB
pub const MAX_IDENTITY_BYTES: usize = 1024;
pub const MAX_PAYLOAD_BYTES: u32 = 16 << 20; // 16 MiB

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("auth token mismatch")]
    BadToken,
    #[error("unexpected auth reply")]
    BadReply,
    #[error("unsupported record version {0}")]
    BadVersion(u8),
    #[error("bad varint")]
    BadVarint,
    #[error("identity too long: {0}")]
    IdentityTooLong(usize),
    #[error("identity is not utf-8")]
    BadIdentity,
    #[error("payload too large: {0}")]
    PayloadTooLarge(u32),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

/// A chunk of tunneled bytes tagged with the peer it belongs to.
///
/// An empty payload is a close notice: the peer on the sending side went away.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    pub identity: String,
    pub payload: Bytes,
}

impl Envelope {
    pub fn data(identity: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Self {
            identity: identity.into(),
            payload: payload.into(),
        }
    }

    pub fn close(identity: impl Into<String>) -> Self {
        Self {
            identity: identity.into(),
            payload: Bytes::new(),
        }
    }

    pub fn is_close(&self) -> bool {
        self.payload.is_empty()
    }
}

pub async fn write_auth_frame<W: AsyncWrite + Unpin>(
    w: &mut W,
    value: &[u8],
) -> Result<(), ProtocolError> {
    let n: u32 = value
        .len()
        .try_into()
        .map_err(|_| ProtocolError::PayloadTooLarge(u32::MAX))?;
    if n > MAX_AUTH_BYTES {
        return Err(ProtocolError::PayloadTooLarge(n));
    }
    let mut frame = Vec::with_capacity(4 + value.len());
    frame.extend_from_slice(&n.to_be_bytes());
    frame.extend_from_slice(value);
    w.write_all(&frame).await?;
    w.flush().await?;
    Ok(())
}

pub async fn read_auth_frame<R: AsyncRead + Unpin>(r: &mut R) -> Result<Vec<u8>, ProtocolError> {
    let n = r.read_u32().await?;
    if n > MAX_AUTH_BYTES {
        return Err(ProtocolError::PayloadTooLarge(n));
    }
    let mut buf = vec![0u8; n as usize];
    r.read_exact(&mut buf).await?;
    Ok(buf)
}

/// Read the peer's token and check it, without answering.
pub async fn verify_auth<R: AsyncRead + Unpin>(r: &mut R, token: &str) -> Result<(), ProtocolError> {
    let got = read_auth_frame(r).await?;
    if got != token.as_bytes() {
        return Err(ProtocolError::BadToken);
    }
    Ok(())
}

/// Responder side of the handshake: read the peer's token and answer `"ok"` if it matches.
///
/// On mismatch nothing is written back; the caller drops the connection.
pub async fn accept_auth<S: AsyncRead + AsyncWrite + Unpin>(
    s: &mut S,
    token: &str,
) -> Result<(), ProtocolError> {
    verify_auth(s, token).await?;
    write_auth_frame(s, AUTH_OK).await
}

/// Initiator side of the handshake: send our token and require an exact `"ok"` back.
pub async fn initiate_auth<S: AsyncRead + AsyncWrite + Unpin>(
    s: &mut S,
    token: &str,
) -> Result<(), ProtocolError> {
    write_auth_frame(s, token.as_bytes()).await?;
    let reply = match read_auth_frame(s).await {
        Ok(v) => v,
        Err(ProtocolError::PayloadTooLarge(_)) => return Err(ProtocolError::BadReply),
        Err(err) => return Err(err),
    };
    if reply != AUTH_OK {
        return Err(ProtocolError::BadReply);
    }
    Ok(())
}

/// Encode one envelope record.
///
/// Layout: `u8 version` + `varint identity len` + `identity` + `u32be payload len` + `payload`.
pub async fn write_envelope<W: AsyncWrite + Unpin>(
    w: &mut W,
    env: &Envelope,
) -> Result<(), ProtocolError> {
    let id = env.identity.as_bytes();
    if id.len() > MAX_IDENTITY_BYTES {
        return Err(ProtocolError::IdentityTooLong(id.len()));
    }
    let n: u32 = env
        .payload
        .len()
        .try_into()
        .map_err(|_| ProtocolError::PayloadTooLarge(u32::MAX))?;
    if n > MAX_PAYLOAD_BYTES {
        return Err(ProtocolError::PayloadTooLarge(n));
    }

    w.write_u8(RECORD_V1).await?;
    write_varint(w, id.len() as u32).await?;
    w.write_all(id).await?;
    w.write_u32(n).await?;
    w.write_all(&env.payload).await?;
    Ok(())
}

pub async fn read_envelope<R: AsyncRead + Unpin>(r: &mut R) -> Result<Envelope, ProtocolError> {
    let ver = r.read_u8().await?;
    if ver != RECORD_V1 {
        return Err(ProtocolError::BadVersion(ver));
    }

    let id_len = read_varint(r).await? as usize;
    if id_len > MAX_IDENTITY_BYTES {
        return Err(ProtocolError::IdentityTooLong(id_len));
    }
    let mut id = vec![0u8; id_len];
    r.read_exact(&mut id).await?;
    let identity = String::from_utf8(id).map_err(|_| ProtocolError::BadIdentity)?;

    let n = r.read_u32().await?;
    if n > MAX_PAYLOAD_BYTES {
        return Err(ProtocolError::PayloadTooLarge(n));
    }
    let mut payload = vec![0u8; n as usize];
    r.read_exact(&mut payload).await?;

    Ok(Envelope {
        identity,
        payload: Bytes::from(payload),
    })
}

async fn write_varint<W: AsyncWrite + Unpin>(w: &mut W, mut v: u32) -> Result<(), ProtocolError> {
    loop {
        let mut temp = (v & 0x7f) as u8;
        v >>= 7;
        if v != 0 {
            temp |= 0x80;
        }
        w.write_u8(temp).await?;
        if v == 0 {
            break;
        }
    }
    Ok(())
}

async fn read_varint<R: AsyncRead + Unpin>(r: &mut R) -> Result<u32, ProtocolError> {
    let mut result: u32 = 0;
    for i in 0..5 {
        let b = r.read_u8().await?;
        result |= u32::from(b & 0x7f) << (7 * i);
        if b & 0x80 == 0 {
            return Ok(result);
        }
    }
    Err(ProtocolError::BadVarint)
}
