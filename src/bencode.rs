use bendy::decoding::{Decoder, Object};
use std::collections::BTreeMap;
use thiserror::Error;

/// Nesting deeper than this is not something a torrent or a tracker reply needs
const MAX_DEPTH: usize = 32;

#[derive(Debug, Error, PartialEq, Eq)]
#[error("invalid bencode: {0}")]
pub struct BencodeError(String);

impl BencodeError {
    // bendy's error only implements Display, keep the message
    fn from_bendy(e: bendy::decoding::Error) -> Self {
        BencodeError(e.to_string())
    }
}

/// A decoded value borrowing its strings from the input. Empty lists and dicts are fine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BencodeView<'a> {
    Integer(i64),
    ByteString(&'a [u8]),
    List(Vec<BencodeView<'a>>),
    Dictionary(BTreeMap<&'a [u8], BencodeView<'a>>),
}

fn view<'ser>(object: Object<'_, 'ser>) -> Result<BencodeView<'ser>, BencodeError> {
    Ok(match object {
        Object::Integer(i) => BencodeView::Integer(
            i.parse()
                .map_err(|_| BencodeError(format!("integer {i} out of range")))?,
        ),
        Object::Bytes(bytes) => BencodeView::ByteString(bytes),
        Object::List(mut list) => {
            let mut items = vec![];
            while let Some(item) = list.next_object().map_err(BencodeError::from_bendy)? {
                items.push(view(item)?);
            }
            BencodeView::List(items)
        }
        Object::Dict(mut dict) => {
            let mut entries = BTreeMap::new();
            while let Some((key, value)) = dict.next_pair().map_err(BencodeError::from_bendy)? {
                entries.insert(key, view(value)?);
            }
            BencodeView::Dictionary(entries)
        }
    })
}

/// Decodes a bencoded dictionary, whatever follows it is ignored
pub fn parse_dict(input: &[u8]) -> Result<BTreeMap<&[u8], BencodeView<'_>>, BencodeError> {
    let mut decoder = Decoder::new(input).with_max_depth(MAX_DEPTH);
    match decoder.next_object().map_err(BencodeError::from_bendy)? {
        Some(object @ Object::Dict(_)) => match view(object)? {
            BencodeView::Dictionary(dict) => Ok(dict),
            _ => Err(BencodeError("expected a dict".to_string())),
        },
        Some(_) => Err(BencodeError("expected a dict".to_string())),
        None => Err(BencodeError("empty input".to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_containers() {
        let dict = parse_dict(b"d5:filesle4:infodee").unwrap();
        assert_eq!(dict[b"files".as_slice()], BencodeView::List(vec![]));
        assert_eq!(dict[b"info".as_slice()], BencodeView::Dictionary(BTreeMap::new()));
        assert!(parse_dict(b"de").unwrap().is_empty());
    }

    #[test]
    fn nested_values() {
        let dict = parse_dict(b"d1:ali-3e2:xye1:bd1:ci0eee").unwrap();
        assert_eq!(
            dict[b"a".as_slice()],
            BencodeView::List(vec![BencodeView::Integer(-3), BencodeView::ByteString(b"xy")])
        );
        let BencodeView::Dictionary(b) = &dict[b"b".as_slice()] else {
            panic!("expected a dict");
        };
        assert_eq!(b[b"c".as_slice()], BencodeView::Integer(0));
    }

    #[test]
    fn rejects_what_is_not_a_dict() {
        assert!(parse_dict(b"").is_err());
        assert!(parse_dict(b"le").is_err());
        assert!(parse_dict(b"i5e").is_err());
        assert!(parse_dict(b"d3:abc").is_err());
        assert!(parse_dict(b"not bencode").is_err());
    }
}
