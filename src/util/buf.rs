use anyhow::{anyhow, bail};
use bytes::{Buf, BufMut};
use bytes_varint::{VarIntSupport, VarIntSupportMut};

pub fn put_string(buf: &mut impl BufMut, s: &str) {
    buf.put_usize_varint(s.len());
    buf.put_slice(s.as_bytes());
}

pub fn try_get_string(buf: &mut impl Buf) -> anyhow::Result<String> {
    let len = try_get_len(buf)?;
    let mut raw = vec![0u8; len];
    buf.copy_to_slice(&mut raw);
    Ok(String::from_utf8(raw)?)
}

/// reads a varint length prefix, checking that at least that many bytes follow
pub fn try_get_len(buf: &mut impl Buf) -> anyhow::Result<usize> {
    let len = buf.try_get_usize_varint()
        .map_err(|e| anyhow!("invalid varint: {:?}", e))?;
    if len > buf.remaining() {
        bail!("length prefix {} exceeds the remaining {} bytes", len, buf.remaining());
    }
    Ok(len)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case::empty("")]
    #[case::short("a")]
    #[case::longer("key17")]
    #[case::multi_byte_len("x".repeat(300))]
    #[case::non_ascii("äöü")]
    fn test_string(#[case] s: String) {
        let mut buf = Vec::new();
        put_string(&mut buf, &s);
        put_string(&mut buf, "tail");

        let mut b: &[u8] = &buf;
        assert_eq!(try_get_string(&mut b).unwrap(), s);
        assert_eq!(try_get_string(&mut b).unwrap(), "tail");
        assert!(b.is_empty());
    }

    #[rstest]
    #[case::no_len(vec![])]
    #[case::len_too_big(vec![5, b'a', b'b'])]
    #[case::invalid_utf8(vec![2, 0xc3, 0x28])]
    fn test_string_invalid(#[case] raw: Vec<u8>) {
        let mut b: &[u8] = &raw;
        assert!(try_get_string(&mut b).is_err());
    }
}
