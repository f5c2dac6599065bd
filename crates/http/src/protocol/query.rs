//! Query string splitting and percent decoding.

/// Decodes `%XX` escapes and `+` as space. Malformed escapes are kept as is.
pub fn url_decode(src: &str) -> String {
    decode(src, true)
}

/// Decodes `%XX` escapes only, for paths where `+` is a literal plus.
pub fn percent_decode(src: &str) -> String {
    decode(src, false)
}

fn decode(src: &str, plus_as_space: bool) -> String {
    let bytes = src.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'+' if plus_as_space => out.push(b' '),
            b'%' if i + 2 < bytes.len() => match (hex_value(bytes[i + 1]), hex_value(bytes[i + 2])) {
                (Some(high), Some(low)) => {
                    out.push((high << 4) | low);
                    i += 2;
                }
                _ => out.push(b'%'),
            },
            b => out.push(b),
        }
        i += 1;
    }
    String::from_utf8(out).unwrap_or_else(|e| String::from_utf8_lossy(e.as_bytes()).into_owned())
}

fn hex_value(b: u8) -> Option<u8> {
    match b {
        b'0'..=b'9' => Some(b - b'0'),
        b'a'..=b'f' => Some(b - b'a' + 10),
        b'A'..=b'F' => Some(b - b'A' + 10),
        _ => None,
    }
}

/// Splits `a=1&b=2&a=3` into decoded pairs, in order. Pairs with an empty key are dropped.
pub fn parse_query(raw: &str) -> Vec<(String, String)> {
    raw.split('&')
        .filter(|pair| !pair.is_empty())
        .filter_map(|pair| {
            let (key, value) = match pair.split_once('=') {
                Some((key, value)) => (url_decode(key), url_decode(value)),
                None => (url_decode(pair), String::new()),
            };
            (!key.is_empty()).then_some((key, value))
        })
        .collect()
}
