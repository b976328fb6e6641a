use bitflags::bitflags;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use super::{
    header::{Header, OpCode},
    next_request_id,
};
use crate::{
    bson::{doc, Document, RawDocumentBuf},
    bson_util,
    cmap::Command,
    error::{Error, ErrorKind, Result},
};

pub(crate) const DEFAULT_MAX_MESSAGE_SIZE_BYTES: i32 = 48 * 1024 * 1024;

/// Represents an OP_MSG wire protocol operation carrying a single type 0 section.
#[derive(Debug, Clone)]
pub(crate) struct Message {
    pub(crate) document_payload: RawDocumentBuf,
    pub(crate) response_to: i32,
    pub(crate) flags: MessageFlags,
    pub(crate) checksum: Option<u32>,
    pub(crate) request_id: Option<i32>,
}

impl Message {
    /// Frames `command` with a single body section, adding `$db`. `response_to` stays 0.
    pub(crate) fn from_command(command: Command, request_id: Option<i32>) -> Result<Self> {
        let mut body = command.body;
        body.insert("$db", command.target_db);
        Ok(Self::with_document(
            RawDocumentBuf::from_document(&body)?,
            request_id,
        ))
    }

    /// Creates a reply-shaped `Message` around an already serialized document.
    pub(crate) fn with_document(document_payload: RawDocumentBuf, request_id: Option<i32>) -> Self {
        Self {
            document_payload,
            response_to: 0,
            flags: MessageFlags::empty(),
            checksum: None,
            request_id,
        }
    }

    /// Gets this message's payload as a Document. If deserialization fails, returns a document
    /// containing the error.
    pub(crate) fn get_command_document(&self) -> Document {
        match self.document_payload.to_document() {
            Ok(document) => document,
            Err(error) => doc! { "serialization error": error.to_string() },
        }
    }

    /// Consumes the message and returns its payload as an owned document.
    pub(crate) fn into_document(self) -> Result<Document> {
        Ok(self.document_payload.to_document()?)
    }

    /// Reads one whole message, header first.
    pub(crate) async fn read_from<R: AsyncRead + Unpin + Send>(
        reader: &mut R,
        max_message_size_bytes: Option<i32>,
    ) -> Result<Self> {
        let header = Header::read_from(reader).await?;
        let max_len = max_message_size_bytes
            .filter(|max| *max > 0)
            .unwrap_or(DEFAULT_MAX_MESSAGE_SIZE_BYTES);
        if header.length > max_len {
            return Err(ErrorKind::InvalidResponse {
                message: format!("Message length {} over maximum {}", header.length, max_len),
            }
            .into());
        }

        let length_remaining = usize::try_from(header.length)
            .ok()
            .and_then(|length| length.checked_sub(Header::LENGTH))
            .ok_or_else(|| {
                Error::invalid_response(format!("invalid message length {}", header.length))
            })?;
        let mut buf = vec![0u8; length_remaining];
        reader.read_exact(&mut buf).await?;

        Self::read_op_msg(&buf, &header)
    }

    fn read_op_msg(buf: &[u8], header: &Header) -> Result<Self> {
        let flag_bytes: [u8; 4] = buf
            .get(..4)
            .and_then(|slice| slice.try_into().ok())
            .ok_or_else(|| Error::invalid_response("OP_MSG is missing its flag bits"))?;
        let flags = MessageFlags::from_bits_truncate(u32::from_le_bytes(flag_bytes));

        let mut rest = &buf[4..];
        let checksum_len = if flags.contains(MessageFlags::CHECKSUM_PRESENT) {
            4
        } else {
            0
        };
        if rest.len() < checksum_len {
            return Err(Error::invalid_response(
                "OP_MSG flagged a checksum that is not present",
            ));
        }
        let (sections, checksum_bytes) = rest.split_at(rest.len() - checksum_len);
        let checksum = checksum_bytes
            .try_into()
            .ok()
            .map(|bytes: [u8; 4]| u32::from_le_bytes(bytes));
        rest = sections;

        let mut document_payload = None;
        while !rest.is_empty() {
            let payload_type = rest[0];
            rest = &rest[1..];
            match payload_type {
                0 => {
                    let length = bson_util::document_length(rest)?;
                    if length > rest.len() {
                        return Err(Error::invalid_response(format!(
                            "The server indicated that the document would be {} bytes long, but \
                             only {} remain",
                            length,
                            rest.len()
                        )));
                    }
                    if document_payload.is_some() {
                        return Err(Error::invalid_response(
                            "an OP_MSG response must contain exactly one payload type 0 section",
                        ));
                    }
                    document_payload = Some(RawDocumentBuf::from_bytes(rest[..length].to_vec())?);
                    rest = &rest[length..];
                }
                other => {
                    return Err(Error::invalid_response(format!(
                        "unsupported OP_MSG section type {}",
                        other
                    )));
                }
            }
        }

        Ok(Self {
            response_to: header.response_to,
            flags,
            document_payload: document_payload.ok_or_else(|| ErrorKind::InvalidResponse {
                message: "an OP_MSG response must contain exactly one payload type 0 section"
                    .into(),
            })?,
            checksum,
            request_id: Some(header.request_id),
        })
    }

    /// Writes the header and every section, then flushes.
    pub(crate) async fn write_to<W: AsyncWrite + Send + Unpin>(&self, writer: &mut W) -> Result<()> {
        let mut sections = Vec::with_capacity(1 + self.document_payload.as_bytes().len());
        // Payload type 0
        sections.push(0);
        sections.extend(self.document_payload.as_bytes());

        let total_length = Header::LENGTH
            + std::mem::size_of::<u32>()
            + sections.len()
            + self
                .checksum
                .as_ref()
                .map(std::mem::size_of_val)
                .unwrap_or(0);

        let header = Header {
            length: i32::try_from(total_length)
                .map_err(|_| Error::invalid_argument("message exceeds the maximum length"))?,
            request_id: self.request_id.unwrap_or_else(next_request_id),
            response_to: self.response_to,
            op_code: OpCode::Message,
        };

        header.write_to(writer).await?;
        writer.write_u32_le(self.flags.bits()).await?;
        writer.write_all(&sections).await?;

        if let Some(checksum) = self.checksum {
            writer.write_u32_le(checksum).await?;
        }

        writer.flush().await?;

        Ok(())
    }
}

bitflags! {
    /// Represents the bitwise flags for an OP_MSG.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub(crate) struct MessageFlags: u32 {
        const CHECKSUM_PRESENT = 0b_0000_0000_0000_0000_0000_0000_0000_0001;
        const MORE_TO_COME     = 0b_0000_0000_0000_0000_0000_0000_0000_0010;
        const EXHAUST_ALLOWED  = 0b_0000_0000_0000_0001_0000_0000_0000_0000;
    }
}
