use lapin::{types::AMQPValue, BasicProperties};
use std::borrow::{Borrow, Cow};
use std::collections::HashMap;

/// Convenience methods for [`lapin::BasicProperties`].
pub trait BasicPropertiesExt {
    /// Lookup header by key.
    fn get_header<Q>(&self, key: &Q) -> Option<&AMQPValue>
    where
        lapin::types::ShortString: Borrow<Q> + Ord,
        Q: Ord + ?Sized;

    /// Lookup a header string value.
    ///
    /// Returns `None` if not a string.
    fn get_header_str<Q>(&self, key: &Q) -> Option<Cow<'_, str>>
    where
        lapin::types::ShortString: Borrow<Q> + Ord,
        Q: Ord + ?Sized,
    {
        match self.get_header(key) {
            Some(AMQPValue::LongString(s)) => Some(String::from_utf8_lossy(s.as_bytes())),
            Some(AMQPValue::ShortString(s)) => Some(Cow::Borrowed(s.as_str())),
            _ => None,
        }
    }

    /// Lookup a header integer value.
    ///
    /// Any AMQP integer type is accepted, as well as strings holding a decimal number.
    /// Returns `None` if the header is missing or cannot be read as an integer.
    fn get_header_int<Q>(&self, key: &Q) -> Option<i64>
    where
        lapin::types::ShortString: Borrow<Q> + Ord,
        Q: Ord + ?Sized,
    {
        match self.get_header(key)? {
            AMQPValue::ShortShortInt(v) => Some(i64::from(*v)),
            AMQPValue::ShortShortUInt(v) => Some(i64::from(*v)),
            AMQPValue::ShortInt(v) => Some(i64::from(*v)),
            AMQPValue::ShortUInt(v) => Some(i64::from(*v)),
            AMQPValue::LongInt(v) => Some(i64::from(*v)),
            AMQPValue::LongUInt(v) => Some(i64::from(*v)),
            AMQPValue::LongLongInt(v) => Some(*v),
            AMQPValue::LongString(_) | AMQPValue::ShortString(_) => {
                self.get_header_str(key)?.trim().parse().ok()
            }
            _ => None,
        }
    }
}

impl BasicPropertiesExt for lapin::BasicProperties {
    fn get_header<Q>(&self, key: &Q) -> Option<&AMQPValue>
    where
        lapin::types::ShortString: Borrow<Q> + Ord,
        Q: Ord + ?Sized,
    {
        self.headers().as_ref()?.inner().get(key)
    }
}

/// Set the value for a header inside a collection of AMQP properties.
///
/// We consume the `properties` input to make sure the caller does not re-use it under the
/// impression that it has been mutated to add the new header.
///
/// # Example
///
/// ```rust
/// use rabbit_lot::amqp::types::{AMQPValue, ShortString};
/// use rabbit_lot::amqp::{BasicProperties, convenience::set_header};
///
/// let properties = BasicProperties::default();
///
/// let header_value = AMQPValue::LongInt(1);
/// let properties = set_header(properties, "x-retries", header_value.clone());
///
/// let headers = properties.headers().as_ref().unwrap().inner();
/// let header_name: ShortString = "x-retries".into();
/// assert_eq!(&header_value, headers.get(&header_name).unwrap());
/// ```
pub fn set_header(
    properties: BasicProperties,
    header_name: &str,
    header_value: AMQPValue,
) -> BasicProperties {
    let mut headers = properties
        .headers()
        .as_ref()
        .map(|h| h.to_owned())
        .unwrap_or_default();
    headers.insert(header_name.into(), header_value);
    properties.with_headers(headers)
}

/// Every header of `properties`, with its value rendered as a string.
///
/// Strings and byte arrays are decoded as UTF-8 (lossily), numbers and booleans are formatted,
/// void values become empty strings. Nested tables and arrays use their debug rendering.
pub fn headers_as_strings(properties: &BasicProperties) -> HashMap<String, String> {
    let Some(headers) = properties.headers().as_ref() else {
        return HashMap::new();
    };
    headers
        .inner()
        .iter()
        .map(|(name, value)| (name.as_str().to_owned(), header_to_string(value)))
        .collect()
}

fn header_to_string(value: &AMQPValue) -> String {
    match value {
        AMQPValue::LongString(s) => String::from_utf8_lossy(s.as_bytes()).into_owned(),
        AMQPValue::ShortString(s) => s.as_str().to_owned(),
        AMQPValue::ByteArray(b) => String::from_utf8_lossy(b.as_slice()).into_owned(),
        AMQPValue::Boolean(v) => v.to_string(),
        AMQPValue::ShortShortInt(v) => v.to_string(),
        AMQPValue::ShortShortUInt(v) => v.to_string(),
        AMQPValue::ShortInt(v) => v.to_string(),
        AMQPValue::ShortUInt(v) => v.to_string(),
        AMQPValue::LongInt(v) => v.to_string(),
        AMQPValue::LongUInt(v) => v.to_string(),
        AMQPValue::LongLongInt(v) => v.to_string(),
        AMQPValue::Float(v) => v.to_string(),
        AMQPValue::Double(v) => v.to_string(),
        AMQPValue::Timestamp(v) => v.to_string(),
        AMQPValue::Void => String::new(),
        other => format!("{other:?}"),
    }
}
