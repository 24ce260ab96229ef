//! ATT codec: turns inbound PDUs into [`ParsedRequest`]s and outbound
//! [`Response`]s into bytes bounded by the session MTU.
use super::constants::*;
use super::error::{AttError, AttErrorCode, AttResult};
use super::types::*;
use crate::uuid::Uuid;

/// How a write reached the server
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteKind {
    /// Write Request, answered with a Write Response
    Request,
    /// Write Command, never answered
    Command,
    /// Prepare Write Request, queued until Execute Write
    Prepare,
}

/// Execute Write Request flag
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecuteFlag {
    /// Apply all prepared writes
    Commit,
    /// Discard all prepared writes
    Cancel,
}

/// A decoded client PDU
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParsedRequest {
    /// Exchange MTU Request
    ExchangeMtu { client_mtu: u16 },
    /// Read Request
    Read { handle: u16 },
    /// Read Blob Request, including one at offset 0
    ReadBlob { handle: u16, offset: u16 },
    /// Write Request, Write Command or Prepare Write Request
    Write {
        handle: u16,
        offset: u16,
        value: Vec<u8>,
        kind: WriteKind,
    },
    /// Execute Write Request
    ExecuteWrite { flag: ExecuteFlag },
    /// Handle Value Confirmation
    Confirmation,
    /// Find Information Request
    FindInformation { start_handle: u16, end_handle: u16 },
    /// Read By Type Request
    ReadByType {
        start_handle: u16,
        end_handle: u16,
        attribute_type: Uuid,
    },
    /// Read By Group Type Request
    ReadByGroupType {
        start_handle: u16,
        end_handle: u16,
        group_type: Uuid,
    },
}

impl ParsedRequest {
    /// Whether the server owes the peer exactly one response PDU
    pub fn needs_response(&self) -> bool {
        !matches!(
            self,
            ParsedRequest::Confirmation
                | ParsedRequest::Write {
                    kind: WriteKind::Command,
                    ..
                }
        )
    }

    /// Opcode this request is carried in
    pub fn opcode(&self) -> u8 {
        match self {
            ParsedRequest::ExchangeMtu { .. } => ATT_EXCHANGE_MTU_REQ,
            ParsedRequest::Read { .. } => ATT_READ_REQ,
            ParsedRequest::ReadBlob { .. } => ATT_READ_BLOB_REQ,
            ParsedRequest::Write { kind, .. } => match kind {
                WriteKind::Request => ATT_WRITE_REQ,
                WriteKind::Command => ATT_WRITE_CMD,
                WriteKind::Prepare => ATT_PREPARE_WRITE_REQ,
            },
            ParsedRequest::ExecuteWrite { .. } => ATT_EXECUTE_WRITE_REQ,
            ParsedRequest::Confirmation => ATT_HANDLE_VALUE_CONF,
            ParsedRequest::FindInformation { .. } => ATT_FIND_INFO_REQ,
            ParsedRequest::ReadByType { .. } => ATT_READ_BY_TYPE_REQ,
            ParsedRequest::ReadByGroupType { .. } => ATT_READ_BY_GROUP_TYPE_REQ,
        }
    }

    /// Handle reported in an Error Response for this request
    pub fn handle(&self) -> u16 {
        match self {
            ParsedRequest::Read { handle }
            | ParsedRequest::ReadBlob { handle, .. }
            | ParsedRequest::Write { handle, .. } => *handle,
            ParsedRequest::FindInformation { start_handle, .. }
            | ParsedRequest::ReadByType { start_handle, .. }
            | ParsedRequest::ReadByGroupType { start_handle, .. } => *start_handle,
            _ => 0,
        }
    }

    /// Encode as a client would put it on the wire
    pub fn encode(&self) -> Vec<u8> {
        match self {
            ParsedRequest::ExchangeMtu { client_mtu } => ExchangeMtuRequest {
                client_mtu: *client_mtu,
            }
            .serialize(),
            ParsedRequest::Read { handle } => ReadRequest { handle: *handle }.serialize(),
            ParsedRequest::ReadBlob { handle, offset } => ReadBlobRequest {
                handle: *handle,
                offset: *offset,
            }
            .serialize(),
            ParsedRequest::Write {
                handle,
                offset,
                value,
                kind,
            } => match kind {
                WriteKind::Request => WriteRequest {
                    handle: *handle,
                    value: value.clone(),
                }
                .serialize(),
                WriteKind::Command => WriteCommand {
                    handle: *handle,
                    value: value.clone(),
                }
                .serialize(),
                WriteKind::Prepare => PrepareWriteRequest {
                    handle: *handle,
                    offset: *offset,
                    value: value.clone(),
                }
                .serialize(),
            },
            ParsedRequest::ExecuteWrite { flag } => ExecuteWriteRequest {
                flags: match flag {
                    ExecuteFlag::Commit => ATT_EXEC_WRITE_COMMIT,
                    ExecuteFlag::Cancel => ATT_EXEC_WRITE_CANCEL,
                },
            }
            .serialize(),
            ParsedRequest::Confirmation => HandleValueConfirmation.serialize(),
            ParsedRequest::FindInformation {
                start_handle,
                end_handle,
            } => FindInformationRequest {
                start_handle: *start_handle,
                end_handle: *end_handle,
            }
            .serialize(),
            ParsedRequest::ReadByType {
                start_handle,
                end_handle,
                attribute_type,
            } => ReadByTypeRequest {
                start_handle: *start_handle,
                end_handle: *end_handle,
                attribute_type: *attribute_type,
            }
            .serialize(),
            ParsedRequest::ReadByGroupType {
                start_handle,
                end_handle,
                group_type,
            } => ReadByGroupTypeRequest {
                start_handle: *start_handle,
                end_handle: *end_handle,
                group_type: *group_type,
            }
            .serialize(),
        }
    }
}

/// Decode an inbound client PDU
pub fn decode(data: &[u8]) -> AttResult<ParsedRequest> {
    let opcode = *data.first().ok_or(AttError::EmptyPdu)?;

    let request = match opcode {
        ATT_EXCHANGE_MTU_REQ => ParsedRequest::ExchangeMtu {
            client_mtu: ExchangeMtuRequest::parse(data)?.client_mtu,
        },
        ATT_READ_REQ => ParsedRequest::Read {
            handle: ReadRequest::parse(data)?.handle,
        },
        ATT_READ_BLOB_REQ => {
            let req = ReadBlobRequest::parse(data)?;
            ParsedRequest::ReadBlob {
                handle: req.handle,
                offset: req.offset,
            }
        }
        ATT_WRITE_REQ => {
            let req = WriteRequest::parse(data)?;
            ParsedRequest::Write {
                handle: req.handle,
                offset: 0,
                value: req.value,
                kind: WriteKind::Request,
            }
        }
        ATT_WRITE_CMD => {
            let cmd = WriteCommand::parse(data)?;
            ParsedRequest::Write {
                handle: cmd.handle,
                offset: 0,
                value: cmd.value,
                kind: WriteKind::Command,
            }
        }
        ATT_PREPARE_WRITE_REQ => {
            let req = PrepareWriteRequest::parse(data)?;
            ParsedRequest::Write {
                handle: req.handle,
                offset: req.offset,
                value: req.value,
                kind: WriteKind::Prepare,
            }
        }
        ATT_EXECUTE_WRITE_REQ => {
            let flag = match ExecuteWriteRequest::parse(data)?.flags {
                ATT_EXEC_WRITE_CANCEL => ExecuteFlag::Cancel,
                ATT_EXEC_WRITE_COMMIT => ExecuteFlag::Commit,
                other => return Err(AttError::InvalidExecuteFlag(other)),
            };
            ParsedRequest::ExecuteWrite { flag }
        }
        ATT_HANDLE_VALUE_CONF => {
            HandleValueConfirmation::parse(data)?;
            ParsedRequest::Confirmation
        }
        ATT_FIND_INFO_REQ => {
            let req = FindInformationRequest::parse(data)?;
            ParsedRequest::FindInformation {
                start_handle: req.start_handle,
                end_handle: req.end_handle,
            }
        }
        ATT_READ_BY_TYPE_REQ => {
            let req = ReadByTypeRequest::parse(data)?;
            ParsedRequest::ReadByType {
                start_handle: req.start_handle,
                end_handle: req.end_handle,
                attribute_type: req.attribute_type,
            }
        }
        ATT_READ_BY_GROUP_TYPE_REQ => {
            let req = ReadByGroupTypeRequest::parse(data)?;
            ParsedRequest::ReadByGroupType {
                start_handle: req.start_handle,
                end_handle: req.end_handle,
                group_type: req.group_type,
            }
        }
        other => return Err(AttError::UnsupportedOpcode(other)),
    };

    Ok(request)
}

/// A server PDU
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    Error(ErrorResponse),
    ExchangeMtu(ExchangeMtuResponse),
    FindInformation(FindInformationResponse),
    ReadByType(ReadByTypeResponse),
    ReadByGroupType(ReadByGroupTypeResponse),
    Read(ReadResponse),
    ReadBlob(ReadBlobResponse),
    Write,
    PrepareWrite(PrepareWriteResponse),
    ExecuteWrite,
    Notification(HandleValueNotification),
    Indication(HandleValueIndication),
}

impl Response {
    /// Shorthand for an Error Response
    pub fn error(request_opcode: u8, handle: u16, error_code: AttErrorCode) -> Self {
        Response::Error(ErrorResponse {
            request_opcode,
            handle,
            error_code,
        })
    }

    /// Fixed header size (opcode plus fixed fields) ahead of the variable payload
    fn header_len(&self) -> usize {
        match self {
            Response::Error(_) => 5,
            Response::ExchangeMtu(_) => 3,
            Response::FindInformation(_)
            | Response::ReadByType(_)
            | Response::ReadByGroupType(_) => 2,
            Response::Read(_) | Response::ReadBlob(_) => 1,
            Response::Write | Response::ExecuteWrite => 1,
            Response::PrepareWrite(_) => ATT_PREPARE_HEADER_SIZE,
            Response::Notification(_) | Response::Indication(_) => ATT_HANDLE_HEADER_SIZE,
        }
    }

    fn payload_len(&self) -> usize {
        match self {
            Response::FindInformation(rsp) => rsp
                .entries
                .iter()
                .map(|(_, uuid)| 2 + uuid.to_att_bytes().len())
                .sum(),
            Response::ReadByType(rsp) => rsp.data.iter().map(|d| 2 + d.value.len()).sum(),
            Response::ReadByGroupType(rsp) => rsp.data.iter().map(|d| 4 + d.value.len()).sum(),
            Response::Read(rsp) => rsp.value.len(),
            Response::ReadBlob(rsp) => rsp.value.len(),
            Response::PrepareWrite(rsp) => rsp.value.len(),
            Response::Notification(ntf) => ntf.value.len(),
            Response::Indication(ind) => ind.value.len(),
            _ => 0,
        }
    }

    /// Decode a server PDU, as the peer would
    pub fn decode(data: &[u8]) -> AttResult<Self> {
        let opcode = *data.first().ok_or(AttError::EmptyPdu)?;

        Ok(match opcode {
            ATT_ERROR_RSP => Response::Error(ErrorResponse::parse(data)?),
            ATT_EXCHANGE_MTU_RSP => Response::ExchangeMtu(ExchangeMtuResponse::parse(data)?),
            ATT_FIND_INFO_RSP => Response::FindInformation(FindInformationResponse::parse(data)?),
            ATT_READ_BY_TYPE_RSP => Response::ReadByType(ReadByTypeResponse::parse(data)?),
            ATT_READ_BY_GROUP_TYPE_RSP => {
                Response::ReadByGroupType(ReadByGroupTypeResponse::parse(data)?)
            }
            ATT_READ_RSP => Response::Read(ReadResponse::parse(data)?),
            ATT_READ_BLOB_RSP => Response::ReadBlob(ReadBlobResponse::parse(data)?),
            ATT_WRITE_RSP => {
                WriteResponse::parse(data)?;
                Response::Write
            }
            ATT_PREPARE_WRITE_RSP => Response::PrepareWrite(PrepareWriteResponse::parse(data)?),
            ATT_EXECUTE_WRITE_RSP => {
                ExecuteWriteResponse::parse(data)?;
                Response::ExecuteWrite
            }
            ATT_HANDLE_VALUE_NTF => Response::Notification(HandleValueNotification::parse(data)?),
            ATT_HANDLE_VALUE_IND => Response::Indication(HandleValueIndication::parse(data)?),
            other => return Err(AttError::UnsupportedOpcode(other)),
        })
    }
}

/// Encode a server PDU for a bearer with the given MTU.
///
/// The size is checked before anything is allocated. An oversized payload is
/// the caller's bug and is reported, never truncated.
pub fn encode(response: &Response, mtu: u16) -> AttResult<Vec<u8>> {
    let header = response.header_len();
    let len = response.payload_len();
    let max = (mtu as usize).saturating_sub(header);
    if len > max {
        return Err(AttError::PayloadTooLarge { len, max, mtu });
    }

    Ok(match response {
        Response::Error(rsp) => rsp.serialize(),
        Response::ExchangeMtu(rsp) => rsp.serialize(),
        Response::FindInformation(rsp) => rsp.serialize(),
        Response::ReadByType(rsp) => rsp.serialize(),
        Response::ReadByGroupType(rsp) => rsp.serialize(),
        Response::Read(rsp) => rsp.serialize(),
        Response::ReadBlob(rsp) => rsp.serialize(),
        Response::Write => WriteResponse.serialize(),
        Response::PrepareWrite(rsp) => rsp.serialize(),
        Response::ExecuteWrite => ExecuteWriteResponse.serialize(),
        Response::Notification(ntf) => ntf.serialize(),
        Response::Indication(ind) => ind.serialize(),
    })
}
