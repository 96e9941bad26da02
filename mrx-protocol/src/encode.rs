// SPDX-FileCopyrightText: 2025 Stanislaw Grams <stanislawgrams@gmail.com>
//
// SPDX-License-Identifier: BSD-2-Clause

//! TLV value encoders. All integers travel big-endian with leading zero
//! bytes stripped; a zero value has a zero-length body.

use std::net::SocketAddr;

use crate::Tag;

/// Address family markers on the wire, independent of any OS constants.
pub const AF_IPV4: u16 = 2;
pub const AF_IPV6: u16 = 10;

fn put_length(buf: &mut Vec<u8>, len: usize) {
    if len < 128 {
        buf.push(len as u8);
    } else {
        // High bit set: low seven bits count the big-endian length bytes.
        let bytes = len.to_be_bytes();
        let skip = bytes.iter().take_while(|&&b| b == 0).count();
        let tail = &bytes[skip..];
        buf.push(0x80 | tail.len() as u8);
        buf.extend_from_slice(tail);
    }
}

fn put_tlv(buf: &mut Vec<u8>, tag: Tag, value: &[u8]) {
    buf.push(tag as u8);
    put_length(buf, value.len());
    buf.extend_from_slice(value);
}

/// Terminate the TLV list.
pub fn encode_eol(buf: &mut Vec<u8>) {
    buf.push(Tag::Eol as u8);
}

pub fn encode_byte(buf: &mut Vec<u8>, tag: Tag, value: u8) {
    put_tlv(buf, tag, &[value]);
}

pub fn encode_bool(buf: &mut Vec<u8>, tag: Tag, value: bool) {
    put_tlv(buf, tag, &[value as u8]);
}

fn minimal_be(value: u64) -> Vec<u8> {
    let bytes = value.to_be_bytes();
    let skip = bytes.iter().take_while(|&&b| b == 0).count();
    bytes[skip..].to_vec()
}

pub fn encode_int32(buf: &mut Vec<u8>, tag: Tag, value: i32) {
    put_tlv(buf, tag, &minimal_be(value as u32 as u64));
}

pub fn encode_int64(buf: &mut Vec<u8>, tag: Tag, value: i64) {
    put_tlv(buf, tag, &minimal_be(value as u64));
}

pub fn encode_float(buf: &mut Vec<u8>, tag: Tag, value: f32) {
    put_tlv(buf, tag, &value.to_be_bytes());
}

pub fn encode_double(buf: &mut Vec<u8>, tag: Tag, value: f64) {
    put_tlv(buf, tag, &value.to_be_bytes());
}

/// UTF-8, no NUL terminator.
pub fn encode_string(buf: &mut Vec<u8>, tag: Tag, value: &str) {
    put_tlv(buf, tag, value.as_bytes());
}

/// Family (2 bytes) + address + port (2 bytes), all big-endian.
pub fn encode_socket(buf: &mut Vec<u8>, tag: Tag, addr: &SocketAddr) {
    let mut body = Vec::with_capacity(20);
    match addr {
        SocketAddr::V4(v4) => {
            body.extend_from_slice(&AF_IPV4.to_be_bytes());
            body.extend_from_slice(&v4.ip().octets());
        }
        SocketAddr::V6(v6) => {
            body.extend_from_slice(&AF_IPV6.to_be_bytes());
            body.extend_from_slice(&v6.ip().octets());
        }
    }
    body.extend_from_slice(&addr.port().to_be_bytes());
    put_tlv(buf, tag, &body);
}

/// Element count (2 bytes) followed by big-endian f32 elements.
pub fn encode_vector(buf: &mut Vec<u8>, tag: Tag, values: &[f32]) {
    let count = values.len().min(u16::MAX as usize);
    let mut body = Vec::with_capacity(2 + 4 * count);
    body.extend_from_slice(&(count as u16).to_be_bytes());
    for value in &values[..count] {
        body.extend_from_slice(&value.to_be_bytes());
    }
    put_tlv(buf, tag, &body);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zero_int_has_empty_body() {
        let mut buf = Vec::new();
        encode_int32(&mut buf, Tag::BinCount, 0);
        assert_eq!(buf, vec![Tag::BinCount as u8, 0]);
    }

    #[test]
    fn test_small_int_is_one_byte() {
        let mut buf = Vec::new();
        encode_int32(&mut buf, Tag::OutputChannels, 2);
        assert_eq!(buf, vec![Tag::OutputChannels as u8, 1, 2]);
    }

    #[test]
    fn test_negative_int_carries_full_width() {
        let mut buf = Vec::new();
        encode_int32(&mut buf, Tag::CommandTag, -1);
        assert_eq!(buf[1], 4);
        assert_eq!(&buf[2..], &[0xff, 0xff, 0xff, 0xff]);
    }

    #[test]
    fn test_extended_length_encoding() {
        let mut buf = Vec::new();
        let values = vec![1.0_f32; 100]; // body = 2 + 400 bytes > 127
        encode_vector(&mut buf, Tag::BinData, &values);
        assert_eq!(buf[0], Tag::BinData as u8);
        assert_eq!(buf[1], 0x80 | 2); // two length bytes follow
        let len = u16::from_be_bytes([buf[2], buf[3]]) as usize;
        assert_eq!(len, 402);
        assert_eq!(buf.len(), 4 + 402);
    }

    #[test]
    fn test_socket_v4_layout() {
        let mut buf = Vec::new();
        let addr: SocketAddr = "239.1.2.3:5004".parse().unwrap();
        encode_socket(&mut buf, Tag::OutputDataDestSocket, &addr);
        assert_eq!(buf[1], 8); // family + addr + port
        assert_eq!(&buf[2..4], &AF_IPV4.to_be_bytes());
        assert_eq!(&buf[4..8], &[239, 1, 2, 3]);
        assert_eq!(u16::from_be_bytes([buf[8], buf[9]]), 5004);
    }
}
