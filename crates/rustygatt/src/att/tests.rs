//! Unit tests for ATT PDU decoding and encoding

use super::*;
use crate::uuid::Uuid;

#[test]
fn test_decode_read_and_blob_requests() {
    // Read Request, handle 0x0003
    let request = decode(&[ATT_READ_REQ, 0x03, 0x00]).unwrap();
    assert_eq!(request, ParsedRequest::Read { handle: 0x0003 });
    assert!(request.needs_response());
    assert_eq!(request.opcode(), ATT_READ_REQ);

    // Read Blob Request, handle 0x0003, offset 22
    let request = decode(&[ATT_READ_BLOB_REQ, 0x03, 0x00, 0x16, 0x00]).unwrap();
    assert_eq!(
        request,
        ParsedRequest::ReadBlob {
            handle: 0x0003,
            offset: 22
        }
    );
    assert_eq!(request.opcode(), ATT_READ_BLOB_REQ);

    // Read Blob at offset 0 stays a Read Blob
    let request = decode(&[ATT_READ_BLOB_REQ, 0x03, 0x00, 0x00, 0x00]).unwrap();
    assert_eq!(
        request,
        ParsedRequest::ReadBlob {
            handle: 0x0003,
            offset: 0
        }
    );
    assert_eq!(request.opcode(), ATT_READ_BLOB_REQ);
    assert_eq!(request.handle(), 0x0003);
    assert_eq!(request.encode(), vec![ATT_READ_BLOB_REQ, 0x03, 0x00, 0x00, 0x00]);
}

#[test]
fn test_decode_write_kinds() {
    let request = decode(&[ATT_WRITE_REQ, 0x05, 0x00, b'h', b'i']).unwrap();
    assert_eq!(
        request,
        ParsedRequest::Write {
            handle: 0x0005,
            offset: 0,
            value: b"hi".to_vec(),
            kind: WriteKind::Request,
        }
    );
    assert!(request.needs_response());

    // Write Command never gets a response
    let request = decode(&[ATT_WRITE_CMD, 0x05, 0x00, 0x01]).unwrap();
    assert!(!request.needs_response());

    // Prepare Write carries an offset
    let request = decode(&[ATT_PREPARE_WRITE_REQ, 0x05, 0x00, 0x02, 0x00, b'C', b'D']).unwrap();
    assert_eq!(
        request,
        ParsedRequest::Write {
            handle: 0x0005,
            offset: 2,
            value: b"CD".to_vec(),
            kind: WriteKind::Prepare,
        }
    );
}

#[test]
fn test_request_round_trip() {
    let requests = vec![
        ParsedRequest::ExchangeMtu { client_mtu: 185 },
        ParsedRequest::Read { handle: 0x0003 },
        ParsedRequest::ReadBlob {
            handle: 0x0003,
            offset: 44,
        },
        ParsedRequest::Write {
            handle: 0x0003,
            offset: 0,
            value: vec![],
            kind: WriteKind::Command,
        },
        ParsedRequest::Write {
            handle: 0x0010,
            offset: 7,
            value: vec![0xAA; 18],
            kind: WriteKind::Prepare,
        },
        ParsedRequest::ExecuteWrite {
            flag: ExecuteFlag::Cancel,
        },
        ParsedRequest::Confirmation,
        ParsedRequest::ReadByGroupType {
            start_handle: 0x0001,
            end_handle: 0xFFFF,
            group_type: Uuid::from_u16(PRIMARY_SERVICE_UUID),
        },
        ParsedRequest::ReadByType {
            start_handle: 0x0001,
            end_handle: 0x0009,
            attribute_type: Uuid::from_u128(0x0123_4567_89AB_CDEF_0123_4567_89AB_CDEF),
        },
        ParsedRequest::FindInformation {
            start_handle: 0x0004,
            end_handle: 0x0004,
        },
    ];

    for request in requests {
        let bytes = request.encode();
        assert_eq!(bytes[0], request.opcode());
        assert_eq!(decode(&bytes).unwrap(), request);
    }
}

#[test]
fn test_decode_truncated_pdu() {
    assert_eq!(decode(&[]), Err(AttError::EmptyPdu));

    // Read Request missing the high handle byte
    assert_eq!(
        decode(&[ATT_READ_REQ, 0x03]),
        Err(AttError::InvalidPdu {
            opcode: ATT_READ_REQ,
            needed: 3,
            actual: 2
        })
    );

    // Prepare Write without an offset
    let err = decode(&[ATT_PREPARE_WRITE_REQ, 0x01, 0x00, 0x00]).unwrap_err();
    assert_eq!(err.to_error_code(), AttErrorCode::InvalidPdu);
}

#[test]
fn test_decode_unknown_opcode() {
    let err = decode(&[0x3F, 0x00]).unwrap_err();
    assert_eq!(err, AttError::UnsupportedOpcode(0x3F));
    assert_eq!(err.to_error_code(), AttErrorCode::RequestNotSupported);

    // Execute Write flag outside {0, 1}
    assert_eq!(
        decode(&[ATT_EXECUTE_WRITE_REQ, 0x02]),
        Err(AttError::InvalidExecuteFlag(0x02))
    );
}

#[test]
fn test_encode_respects_mtu() {
    // 20 bytes of value fit a 23-byte MTU notification exactly
    let fits = Response::Notification(HandleValueNotification {
        handle: 0x0003,
        value: vec![0x55; 20],
    });
    let bytes = encode(&fits, ATT_DEFAULT_MTU).unwrap();
    assert_eq!(bytes.len(), ATT_DEFAULT_MTU as usize);
    assert_eq!(&bytes[..3], &[ATT_HANDLE_VALUE_NTF, 0x03, 0x00]);

    // One more byte is a caller bug, not a silent truncation
    let too_big = Response::Notification(HandleValueNotification {
        handle: 0x0003,
        value: vec![0x55; 21],
    });
    assert_eq!(
        encode(&too_big, ATT_DEFAULT_MTU),
        Err(AttError::PayloadTooLarge {
            len: 21,
            max: 20,
            mtu: ATT_DEFAULT_MTU
        })
    );

    // A Read Response may carry mtu - 1 bytes
    let read = Response::Read(ReadResponse {
        value: vec![0x01; 22],
    });
    assert_eq!(encode(&read, ATT_DEFAULT_MTU).unwrap().len(), 23);
}

#[test]
fn test_error_response_wire_format() {
    let response = Response::error(ATT_WRITE_REQ, 0x0003, AttErrorCode::WriteNotPermitted);
    let bytes = encode(&response, ATT_DEFAULT_MTU).unwrap();
    assert_eq!(
        bytes,
        vec![
            ATT_ERROR_RSP,
            ATT_WRITE_REQ,
            0x03,
            0x00,
            ATT_ERROR_WRITE_NOT_PERMITTED
        ]
    );
    assert_eq!(Response::decode(&bytes).unwrap(), response);
}

#[test]
fn test_find_information_uses_uuid_format_of_first_entry() {
    let response = Response::FindInformation(FindInformationResponse {
        entries: vec![(0x0004, Uuid::from_u16(CLIENT_CHAR_CONFIG_UUID))],
    });
    let bytes = encode(&response, ATT_DEFAULT_MTU).unwrap();
    assert_eq!(
        bytes,
        vec![ATT_FIND_INFO_RSP, ATT_FIND_INFO_RSP_FORMAT_16BIT, 0x04, 0x00, 0x02, 0x29]
    );
    assert_eq!(Response::decode(&bytes).unwrap(), response);
}
