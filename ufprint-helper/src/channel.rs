use serde::{Serialize, de::DeserializeOwned};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use ufprint::error::{ProtocolError, Result};

/// Largest frame either side accepts.
pub const MAX_FRAME_LEN: usize = 64 * 1024;

pub async fn write_message<T, W>(stream: &mut W, message: &T) -> Result<()>
where
    T: Serialize,
    W: AsyncWriteExt + Unpin,
{
    let data = serde_json::to_vec(message)?;

    if data.len() > MAX_FRAME_LEN {
        return Err(ProtocolError::SchemaInvalid.into());
    }

    let len: u32 = data.len().try_into()?;

    stream.write_u32(len).await?;
    stream.write_all(&data).await?;
    stream.flush().await?;

    Ok(())
}

pub async fn read_message<D, R>(stream: &mut R) -> Result<D>
where
    D: DeserializeOwned,
    R: AsyncReadExt + Unpin,
{
    let len: usize = stream.read_u32().await?.try_into()?;

    if len > MAX_FRAME_LEN {
        return Err(ProtocolError::SchemaInvalid.into());
    }

    let mut buf = vec![0u8; len];

    stream.read_exact(&mut buf).await?;

    let message: D = serde_json::from_slice(&buf)?;

    Ok(message)
}
