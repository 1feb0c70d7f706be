use std::borrow::Cow;

/// Port dialed when the server signals port `"0"`.
pub const DEFAULT_LOCAL_PORT: &str = "80";

/// Resolve the backend address for a proxy request.
///
/// A fixed `local_addr` wins over whatever port the server asked for. Otherwise the
/// server-supplied port is dialed on loopback, with `"0"` meaning port 80.
/// Both inputs are trimmed; a blank fixed address counts as unset.
pub fn local_target<'a>(port: &'a str, local_addr: Option<&'a str>) -> Cow<'a, str> {
    if let Some(addr) = local_addr.map(str::trim).filter(|a| !a.is_empty()) {
        return Cow::Borrowed(addr);
    }
    let port = match port.trim() {
        "0" => DEFAULT_LOCAL_PORT,
        p => p,
    };
    Cow::Owned(format!("127.0.0.1:{port}"))
}
