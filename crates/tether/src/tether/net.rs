use std::borrow::Cow;

/// Normalize a bind/listen address.
///
/// Listen endpoints are usually given as a bare port (`"8888"`) or the shorthand `":8888"`,
/// both meaning "bind on all interfaces". Tokio bind APIs accept neither, so we normalize them
/// to `"0.0.0.0:PORT"`.
pub fn normalize_bind_addr(addr: &str) -> Cow<'_, str> {
    let addr = addr.trim();
    if addr.starts_with(':') {
        Cow::Owned(format!("0.0.0.0{addr}"))
    } else if !addr.is_empty() && addr.bytes().all(|b| b.is_ascii_digit()) {
        Cow::Owned(format!("0.0.0.0:{addr}"))
    } else {
        Cow::Borrowed(addr)
    }
}

#[cfg(test)]
mod tests {
    use super::normalize_bind_addr;

    #[test]
    fn normalize_bind_addr_port_only() {
        assert_eq!(normalize_bind_addr(":8080").as_ref(), "0.0.0.0:8080");
        assert_eq!(normalize_bind_addr(" :7000 ").as_ref(), "0.0.0.0:7000");
        assert_eq!(normalize_bind_addr("9999").as_ref(), "0.0.0.0:9999");
    }

    #[test]
    fn normalize_bind_addr_passthrough() {
        assert_eq!(
            normalize_bind_addr("127.0.0.1:8080").as_ref(),
            "127.0.0.1:8080"
        );
        assert_eq!(normalize_bind_addr("[::]:8080").as_ref(), "[::]:8080");
        assert_eq!(normalize_bind_addr("localhost:1").as_ref(), "localhost:1");
    }
}
