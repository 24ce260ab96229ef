//! Type definitions for the ATT protocol
//!
//! One struct per PDU. `parse` takes the whole PDU including the opcode byte,
//! `serialize` produces it.
use super::constants::*;
use super::error::{AttError, AttErrorCode, AttResult};
use crate::uuid::Uuid;
use byteorder::{LittleEndian, ReadBytesExt};
use std::io::Cursor;

/// ATT packet formats
pub trait AttPacket: Sized {
    /// Opcode for this packet
    fn opcode() -> u8;

    /// Parse packet from bytes
    fn parse(data: &[u8]) -> AttResult<Self>;

    /// Serialize packet to bytes
    fn serialize(&self) -> Vec<u8>;
}

/// Checks opcode and minimum length, returning a cursor positioned after the opcode.
fn open(data: &[u8], opcode: u8, min_len: usize) -> AttResult<Cursor<&[u8]>> {
    match data.first() {
        None => return Err(AttError::EmptyPdu),
        Some(&actual) if actual != opcode => {
            return Err(AttError::UnexpectedOpcode {
                expected: opcode,
                actual,
            })
        }
        Some(_) => {}
    }
    if data.len() < min_len {
        return Err(AttError::truncated(opcode, min_len, data.len()));
    }
    let mut cursor = Cursor::new(data);
    cursor.set_position(1);
    Ok(cursor)
}

fn read_u16(cursor: &mut Cursor<&[u8]>) -> AttResult<u16> {
    let opcode = cursor.get_ref()[0];
    let actual = cursor.get_ref().len();
    cursor
        .read_u16::<LittleEndian>()
        .map_err(|_| AttError::truncated(opcode, cursor.position() as usize + 2, actual))
}

fn rest<'a>(cursor: &Cursor<&'a [u8]>) -> &'a [u8] {
    let data: &'a [u8] = *cursor.get_ref();
    &data[cursor.position() as usize..]
}

fn read_uuid(cursor: &Cursor<&[u8]>) -> AttResult<Uuid> {
    let raw = rest(cursor);
    Uuid::from_att_bytes(raw).ok_or(AttError::InvalidUuidLength(raw.len()))
}

/// Error response packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorResponse {
    /// Request opcode in error
    pub request_opcode: u8,
    /// Attribute handle in error
    pub handle: u16,
    /// Error code
    pub error_code: AttErrorCode,
}

impl AttPacket for ErrorResponse {
    fn opcode() -> u8 {
        ATT_ERROR_RSP
    }

    fn parse(data: &[u8]) -> AttResult<Self> {
        let mut cursor = open(data, Self::opcode(), 5)?;
        let request_opcode = data[1];
        cursor.set_position(2);
        let handle = read_u16(&mut cursor)?;

        Ok(Self {
            request_opcode,
            handle,
            error_code: data[4].into(),
        })
    }

    fn serialize(&self) -> Vec<u8> {
        let mut packet = Vec::with_capacity(5);
        packet.push(Self::opcode());
        packet.push(self.request_opcode);
        packet.extend_from_slice(&self.handle.to_le_bytes());
        packet.push(self.error_code.into());
        packet
    }
}

/// Exchange MTU Request packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExchangeMtuRequest {
    /// Client Rx MTU size
    pub client_mtu: u16,
}

impl AttPacket for ExchangeMtuRequest {
    fn opcode() -> u8 {
        ATT_EXCHANGE_MTU_REQ
    }

    fn parse(data: &[u8]) -> AttResult<Self> {
        let mut cursor = open(data, Self::opcode(), 3)?;
        Ok(Self {
            client_mtu: read_u16(&mut cursor)?,
        })
    }

    fn serialize(&self) -> Vec<u8> {
        let mut packet = vec![Self::opcode()];
        packet.extend_from_slice(&self.client_mtu.to_le_bytes());
        packet
    }
}

/// Exchange MTU Response packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExchangeMtuResponse {
    /// Server Rx MTU size
    pub server_mtu: u16,
}

impl AttPacket for ExchangeMtuResponse {
    fn opcode() -> u8 {
        ATT_EXCHANGE_MTU_RSP
    }

    fn parse(data: &[u8]) -> AttResult<Self> {
        let mut cursor = open(data, Self::opcode(), 3)?;
        Ok(Self {
            server_mtu: read_u16(&mut cursor)?,
        })
    }

    fn serialize(&self) -> Vec<u8> {
        let mut packet = vec![Self::opcode()];
        packet.extend_from_slice(&self.server_mtu.to_le_bytes());
        packet
    }
}

/// Find Information Request packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FindInformationRequest {
    /// First requested handle
    pub start_handle: u16,
    /// Last requested handle
    pub end_handle: u16,
}

impl AttPacket for FindInformationRequest {
    fn opcode() -> u8 {
        ATT_FIND_INFO_REQ
    }

    fn parse(data: &[u8]) -> AttResult<Self> {
        let mut cursor = open(data, Self::opcode(), 5)?;
        Ok(Self {
            start_handle: read_u16(&mut cursor)?,
            end_handle: read_u16(&mut cursor)?,
        })
    }

    fn serialize(&self) -> Vec<u8> {
        let mut packet = Vec::with_capacity(5);
        packet.push(Self::opcode());
        packet.extend_from_slice(&self.start_handle.to_le_bytes());
        packet.extend_from_slice(&self.end_handle.to_le_bytes());
        packet
    }
}

/// Find Information Response packet.
///
/// All entries must share one UUID width; the format byte is derived from the
/// first entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FindInformationResponse {
    /// Handle/type pairs
    pub entries: Vec<(u16, Uuid)>,
}

impl FindInformationResponse {
    fn format(&self) -> u8 {
        match self.entries.first() {
            Some((_, uuid)) if uuid.as_u16().is_none() => ATT_FIND_INFO_RSP_FORMAT_128BIT,
            _ => ATT_FIND_INFO_RSP_FORMAT_16BIT,
        }
    }
}

impl AttPacket for FindInformationResponse {
    fn opcode() -> u8 {
        ATT_FIND_INFO_RSP
    }

    fn parse(data: &[u8]) -> AttResult<Self> {
        open(data, Self::opcode(), 2)?;
        let uuid_len = match data[1] {
            ATT_FIND_INFO_RSP_FORMAT_16BIT => 2,
            ATT_FIND_INFO_RSP_FORMAT_128BIT => 16,
            _ => return Err(AttError::InvalidUuidLength(0)),
        };

        let entries = data[2..]
            .chunks_exact(2 + uuid_len)
            .filter_map(|chunk| {
                let handle = u16::from_le_bytes([chunk[0], chunk[1]]);
                Uuid::from_att_bytes(&chunk[2..]).map(|uuid| (handle, uuid))
            })
            .collect();

        Ok(Self { entries })
    }

    fn serialize(&self) -> Vec<u8> {
        let mut packet = vec![Self::opcode(), self.format()];
        for (handle, uuid) in &self.entries {
            packet.extend_from_slice(&handle.to_le_bytes());
            packet.extend_from_slice(&uuid.to_att_bytes());
        }
        packet
    }
}

/// Read By Type Request packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadByTypeRequest {
    /// First requested handle
    pub start_handle: u16,
    /// Last requested handle
    pub end_handle: u16,
    /// Attribute type UUID
    pub attribute_type: Uuid,
}

impl AttPacket for ReadByTypeRequest {
    fn opcode() -> u8 {
        ATT_READ_BY_TYPE_REQ
    }

    fn parse(data: &[u8]) -> AttResult<Self> {
        let mut cursor = open(data, Self::opcode(), 7)?;
        let start_handle = read_u16(&mut cursor)?;
        let end_handle = read_u16(&mut cursor)?;

        Ok(Self {
            start_handle,
            end_handle,
            attribute_type: read_uuid(&cursor)?,
        })
    }

    fn serialize(&self) -> Vec<u8> {
        let mut packet = vec![Self::opcode()];
        packet.extend_from_slice(&self.start_handle.to_le_bytes());
        packet.extend_from_slice(&self.end_handle.to_le_bytes());
        packet.extend_from_slice(&self.attribute_type.to_att_bytes());
        packet
    }
}

/// Handle and value in Read By Type Response
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandleValue {
    /// Attribute handle
    pub handle: u16,
    /// Attribute value
    pub value: Vec<u8>,
}

/// Read By Type Response packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadByTypeResponse {
    /// Length of each item
    pub length: u8,
    /// List of handle-value pairs
    pub data: Vec<HandleValue>,
}

impl AttPacket for ReadByTypeResponse {
    fn opcode() -> u8 {
        ATT_READ_BY_TYPE_RSP
    }

    fn parse(data: &[u8]) -> AttResult<Self> {
        open(data, Self::opcode(), 2)?;
        let length = data[1];
        if length < 2 {
            return Err(AttError::truncated(Self::opcode(), 4, data.len()));
        }

        let data_list = data[2..]
            .chunks_exact(length as usize)
            .map(|chunk| HandleValue {
                handle: u16::from_le_bytes([chunk[0], chunk[1]]),
                value: chunk[2..].to_vec(),
            })
            .collect();

        Ok(Self {
            length,
            data: data_list,
        })
    }

    fn serialize(&self) -> Vec<u8> {
        let mut packet = vec![Self::opcode(), self.length];
        for item in &self.data {
            packet.extend_from_slice(&item.handle.to_le_bytes());
            packet.extend_from_slice(&item.value);
        }
        packet
    }
}

/// Read By Group Type Request packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadByGroupTypeRequest {
    /// First requested handle
    pub start_handle: u16,
    /// Last requested handle
    pub end_handle: u16,
    /// Group type UUID
    pub group_type: Uuid,
}

impl AttPacket for ReadByGroupTypeRequest {
    fn opcode() -> u8 {
        ATT_READ_BY_GROUP_TYPE_REQ
    }

    fn parse(data: &[u8]) -> AttResult<Self> {
        let mut cursor = open(data, Self::opcode(), 7)?;
        let start_handle = read_u16(&mut cursor)?;
        let end_handle = read_u16(&mut cursor)?;

        Ok(Self {
            start_handle,
            end_handle,
            group_type: read_uuid(&cursor)?,
        })
    }

    fn serialize(&self) -> Vec<u8> {
        let mut packet = vec![Self::opcode()];
        packet.extend_from_slice(&self.start_handle.to_le_bytes());
        packet.extend_from_slice(&self.end_handle.to_le_bytes());
        packet.extend_from_slice(&self.group_type.to_att_bytes());
        packet
    }
}

/// Attribute data in Read By Group Type Response
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttributeData {
    /// Attribute handle
    pub handle: u16,
    /// End group handle
    pub end_group_handle: u16,
    /// Attribute value
    pub value: Vec<u8>,
}

/// Read By Group Type Response packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadByGroupTypeResponse {
    /// Length of each item
    pub length: u8,
    /// List of attribute data
    pub data: Vec<AttributeData>,
}

impl AttPacket for ReadByGroupTypeResponse {
    fn opcode() -> u8 {
        ATT_READ_BY_GROUP_TYPE_RSP
    }

    fn parse(data: &[u8]) -> AttResult<Self> {
        open(data, Self::opcode(), 2)?;
        let length = data[1];
        if length < 4 {
            return Err(AttError::truncated(Self::opcode(), 6, data.len()));
        }

        let data_list = data[2..]
            .chunks_exact(length as usize)
            .map(|chunk| AttributeData {
                handle: u16::from_le_bytes([chunk[0], chunk[1]]),
                end_group_handle: u16::from_le_bytes([chunk[2], chunk[3]]),
                value: chunk[4..].to_vec(),
            })
            .collect();

        Ok(Self {
            length,
            data: data_list,
        })
    }

    fn serialize(&self) -> Vec<u8> {
        let mut packet = vec![Self::opcode(), self.length];
        for item in &self.data {
            packet.extend_from_slice(&item.handle.to_le_bytes());
            packet.extend_from_slice(&item.end_group_handle.to_le_bytes());
            packet.extend_from_slice(&item.value);
        }
        packet
    }
}

/// Read Request packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadRequest {
    /// Handle to read
    pub handle: u16,
}

impl AttPacket for ReadRequest {
    fn opcode() -> u8 {
        ATT_READ_REQ
    }

    fn parse(data: &[u8]) -> AttResult<Self> {
        let mut cursor = open(data, Self::opcode(), 3)?;
        Ok(Self {
            handle: read_u16(&mut cursor)?,
        })
    }

    fn serialize(&self) -> Vec<u8> {
        let mut packet = vec![Self::opcode()];
        packet.extend_from_slice(&self.handle.to_le_bytes());
        packet
    }
}

/// Read Response packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadResponse {
    /// Attribute value (possibly the first chunk of a long value)
    pub value: Vec<u8>,
}

impl AttPacket for ReadResponse {
    fn opcode() -> u8 {
        ATT_READ_RSP
    }

    fn parse(data: &[u8]) -> AttResult<Self> {
        open(data, Self::opcode(), 1)?;
        Ok(Self {
            value: data[1..].to_vec(),
        })
    }

    fn serialize(&self) -> Vec<u8> {
        let mut packet = Vec::with_capacity(1 + self.value.len());
        packet.push(Self::opcode());
        packet.extend_from_slice(&self.value);
        packet
    }
}

/// Read Blob Request packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadBlobRequest {
    /// Handle to read
    pub handle: u16,
    /// Value offset
    pub offset: u16,
}

impl AttPacket for ReadBlobRequest {
    fn opcode() -> u8 {
        ATT_READ_BLOB_REQ
    }

    fn parse(data: &[u8]) -> AttResult<Self> {
        let mut cursor = open(data, Self::opcode(), 5)?;
        Ok(Self {
            handle: read_u16(&mut cursor)?,
            offset: read_u16(&mut cursor)?,
        })
    }

    fn serialize(&self) -> Vec<u8> {
        let mut packet = Vec::with_capacity(5);
        packet.push(Self::opcode());
        packet.extend_from_slice(&self.handle.to_le_bytes());
        packet.extend_from_slice(&self.offset.to_le_bytes());
        packet
    }
}

/// Read Blob Response packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadBlobResponse {
    /// Part of the attribute value starting at the requested offset
    pub value: Vec<u8>,
}

impl AttPacket for ReadBlobResponse {
    fn opcode() -> u8 {
        ATT_READ_BLOB_RSP
    }

    fn parse(data: &[u8]) -> AttResult<Self> {
        open(data, Self::opcode(), 1)?;
        Ok(Self {
            value: data[1..].to_vec(),
        })
    }

    fn serialize(&self) -> Vec<u8> {
        let mut packet = Vec::with_capacity(1 + self.value.len());
        packet.push(Self::opcode());
        packet.extend_from_slice(&self.value);
        packet
    }
}

/// Write Request packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteRequest {
    /// Handle to write
    pub handle: u16,
    /// Value to write
    pub value: Vec<u8>,
}

impl AttPacket for WriteRequest {
    fn opcode() -> u8 {
        ATT_WRITE_REQ
    }

    fn parse(data: &[u8]) -> AttResult<Self> {
        let mut cursor = open(data, Self::opcode(), 3)?;
        let handle = read_u16(&mut cursor)?;
        Ok(Self {
            handle,
            value: rest(&cursor).to_vec(),
        })
    }

    fn serialize(&self) -> Vec<u8> {
        let mut packet = Vec::with_capacity(3 + self.value.len());
        packet.push(Self::opcode());
        packet.extend_from_slice(&self.handle.to_le_bytes());
        packet.extend_from_slice(&self.value);
        packet
    }
}

/// Write Response packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteResponse;

impl AttPacket for WriteResponse {
    fn opcode() -> u8 {
        ATT_WRITE_RSP
    }

    fn parse(data: &[u8]) -> AttResult<Self> {
        open(data, Self::opcode(), 1)?;
        Ok(Self)
    }

    fn serialize(&self) -> Vec<u8> {
        vec![Self::opcode()]
    }
}

/// Write Command packet (write without response)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteCommand {
    /// Handle to write
    pub handle: u16,
    /// Value to write
    pub value: Vec<u8>,
}

impl AttPacket for WriteCommand {
    fn opcode() -> u8 {
        ATT_WRITE_CMD
    }

    fn parse(data: &[u8]) -> AttResult<Self> {
        let mut cursor = open(data, Self::opcode(), 3)?;
        let handle = read_u16(&mut cursor)?;
        Ok(Self {
            handle,
            value: rest(&cursor).to_vec(),
        })
    }

    fn serialize(&self) -> Vec<u8> {
        let mut packet = Vec::with_capacity(3 + self.value.len());
        packet.push(Self::opcode());
        packet.extend_from_slice(&self.handle.to_le_bytes());
        packet.extend_from_slice(&self.value);
        packet
    }
}

/// Prepare Write Request packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrepareWriteRequest {
    /// Handle to write
    pub handle: u16,
    /// Value offset
    pub offset: u16,
    /// Part of the value
    pub value: Vec<u8>,
}

impl AttPacket for PrepareWriteRequest {
    fn opcode() -> u8 {
        ATT_PREPARE_WRITE_REQ
    }

    fn parse(data: &[u8]) -> AttResult<Self> {
        let mut cursor = open(data, Self::opcode(), ATT_PREPARE_HEADER_SIZE)?;
        let handle = read_u16(&mut cursor)?;
        let offset = read_u16(&mut cursor)?;
        Ok(Self {
            handle,
            offset,
            value: rest(&cursor).to_vec(),
        })
    }

    fn serialize(&self) -> Vec<u8> {
        let mut packet = Vec::with_capacity(ATT_PREPARE_HEADER_SIZE + self.value.len());
        packet.push(Self::opcode());
        packet.extend_from_slice(&self.handle.to_le_bytes());
        packet.extend_from_slice(&self.offset.to_le_bytes());
        packet.extend_from_slice(&self.value);
        packet
    }
}

/// Prepare Write Response packet (echoes the request)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrepareWriteResponse {
    /// Handle to write
    pub handle: u16,
    /// Value offset
    pub offset: u16,
    /// Part of the value
    pub value: Vec<u8>,
}

impl AttPacket for PrepareWriteResponse {
    fn opcode() -> u8 {
        ATT_PREPARE_WRITE_RSP
    }

    fn parse(data: &[u8]) -> AttResult<Self> {
        let mut cursor = open(data, Self::opcode(), ATT_PREPARE_HEADER_SIZE)?;
        let handle = read_u16(&mut cursor)?;
        let offset = read_u16(&mut cursor)?;
        Ok(Self {
            handle,
            offset,
            value: rest(&cursor).to_vec(),
        })
    }

    fn serialize(&self) -> Vec<u8> {
        let mut packet = Vec::with_capacity(ATT_PREPARE_HEADER_SIZE + self.value.len());
        packet.push(Self::opcode());
        packet.extend_from_slice(&self.handle.to_le_bytes());
        packet.extend_from_slice(&self.offset.to_le_bytes());
        packet.extend_from_slice(&self.value);
        packet
    }
}

/// Execute Write Request packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecuteWriteRequest {
    /// 0x00 cancels, 0x01 commits
    pub flags: u8,
}

impl AttPacket for ExecuteWriteRequest {
    fn opcode() -> u8 {
        ATT_EXECUTE_WRITE_REQ
    }

    fn parse(data: &[u8]) -> AttResult<Self> {
        open(data, Self::opcode(), 2)?;
        Ok(Self { flags: data[1] })
    }

    fn serialize(&self) -> Vec<u8> {
        vec![Self::opcode(), self.flags]
    }
}

/// Execute Write Response packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecuteWriteResponse;

impl AttPacket for ExecuteWriteResponse {
    fn opcode() -> u8 {
        ATT_EXECUTE_WRITE_RSP
    }

    fn parse(data: &[u8]) -> AttResult<Self> {
        open(data, Self::opcode(), 1)?;
        Ok(Self)
    }

    fn serialize(&self) -> Vec<u8> {
        vec![Self::opcode()]
    }
}

/// Handle Value Notification packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandleValueNotification {
    /// Attribute handle
    pub handle: u16,
    /// Attribute value
    pub value: Vec<u8>,
}

impl AttPacket for HandleValueNotification {
    fn opcode() -> u8 {
        ATT_HANDLE_VALUE_NTF
    }

    fn parse(data: &[u8]) -> AttResult<Self> {
        let mut cursor = open(data, Self::opcode(), ATT_HANDLE_HEADER_SIZE)?;
        let handle = read_u16(&mut cursor)?;
        Ok(Self {
            handle,
            value: rest(&cursor).to_vec(),
        })
    }

    fn serialize(&self) -> Vec<u8> {
        let mut packet = Vec::with_capacity(ATT_HANDLE_HEADER_SIZE + self.value.len());
        packet.push(Self::opcode());
        packet.extend_from_slice(&self.handle.to_le_bytes());
        packet.extend_from_slice(&self.value);
        packet
    }
}

/// Handle Value Indication packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandleValueIndication {
    /// Attribute handle
    pub handle: u16,
    /// Attribute value
    pub value: Vec<u8>,
}

impl AttPacket for HandleValueIndication {
    fn opcode() -> u8 {
        ATT_HANDLE_VALUE_IND
    }

    fn parse(data: &[u8]) -> AttResult<Self> {
        let mut cursor = open(data, Self::opcode(), ATT_HANDLE_HEADER_SIZE)?;
        let handle = read_u16(&mut cursor)?;
        Ok(Self {
            handle,
            value: rest(&cursor).to_vec(),
        })
    }

    fn serialize(&self) -> Vec<u8> {
        let mut packet = Vec::with_capacity(ATT_HANDLE_HEADER_SIZE + self.value.len());
        packet.push(Self::opcode());
        packet.extend_from_slice(&self.handle.to_le_bytes());
        packet.extend_from_slice(&self.value);
        packet
    }
}

/// Handle Value Confirmation packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandleValueConfirmation;

impl AttPacket for HandleValueConfirmation {
    fn opcode() -> u8 {
        ATT_HANDLE_VALUE_CONF
    }

    fn parse(data: &[u8]) -> AttResult<Self> {
        open(data, Self::opcode(), 1)?;
        Ok(Self)
    }

    fn serialize(&self) -> Vec<u8> {
        vec![Self::opcode()]
    }
}
