use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{Error, Result};

/// Only OP_MSG is spoken; anything else from the server is a protocol error.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub(crate) enum OpCode {
    Message = 2013,
}

impl TryFrom<i32> for OpCode {
    type Error = Error;

    fn try_from(code: i32) -> Result<Self> {
        match code {
            2013 => Ok(OpCode::Message),
            other => Err(Error::invalid_response(format!(
                "unsupported wire protocol opcode {}",
                other
            ))),
        }
    }
}

/// The four little-endian int32s that start every wire message.
#[derive(Debug)]
pub(crate) struct Header {
    /// Total message length, header included.
    pub(crate) length: i32,
    pub(crate) request_id: i32,
    pub(crate) response_to: i32,
    pub(crate) op_code: OpCode,
}

impl Header {
    pub(crate) const LENGTH: usize = 16;

    fn to_bytes(&self) -> [u8; Self::LENGTH] {
        let mut bytes = [0u8; Self::LENGTH];
        let fields = [
            self.length,
            self.request_id,
            self.response_to,
            self.op_code as i32,
        ];
        for (chunk, field) in bytes.chunks_exact_mut(4).zip(fields) {
            chunk.copy_from_slice(&field.to_le_bytes());
        }
        bytes
    }

    pub(crate) async fn write_to<W: AsyncWrite + Unpin>(&self, writer: &mut W) -> Result<()> {
        writer.write_all(&self.to_bytes()).await?;
        Ok(())
    }

    pub(crate) async fn read_from<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Self> {
        let mut bytes = [0u8; Self::LENGTH];
        reader.read_exact(&mut bytes).await?;

        let field = |index: usize| {
            let start = index * 4;
            i32::from_le_bytes([
                bytes[start],
                bytes[start + 1],
                bytes[start + 2],
                bytes[start + 3],
            ])
        };
        Ok(Self {
            length: field(0),
            request_id: field(1),
            response_to: field(2),
            op_code: OpCode::try_from(field(3))?,
        })
    }
}
