pub type Headers = Vec<(String, String)>;

pub fn header_get<'a>(headers: &'a Headers, name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case(name))
        .map(|(_, v)| v.as_str())
}

pub fn header_set(headers: &mut Headers, name: &str, value: impl Into<String>) {
    let value = value.into();
    for (k, v) in headers.iter_mut() {
        if k.eq_ignore_ascii_case(name) {
            *v = value;
            return;
        }
    }
    headers.push((name.to_string(), value));
}

pub fn set_bearer(headers: &mut Headers, token: &str) {
    header_set(headers, "authorization", format!("Bearer {token}"));
}

pub fn set_api_key(headers: &mut Headers, name: &str, key: &str) {
    header_set(headers, name, key);
}

pub fn set_json_body(headers: &mut Headers) {
    header_set(headers, "content-type", "application/json");
}

pub fn set_accept_json(headers: &mut Headers) {
    header_set(headers, "accept", "application/json");
}

pub fn set_accept_sse(headers: &mut Headers) {
    header_set(headers, "accept", "text/event-stream");
}
