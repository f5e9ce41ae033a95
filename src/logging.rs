//! Apache-compatible access-log formatting.
//!
//! Token set: `%v %h %l %u %t %r %>s %b %{Referer}i %{User-agent}i`. This is
//! a pure formatter — `server::log_access` emits it per request when
//! `logs.format = "apache"`, or falls back to a structured `tracing` event
//! carrying the same fields otherwise.

use httpdate::fmt_http_date;
use std::time::SystemTime;

pub struct AccessLogFields<'a> {
    pub vhost: &'a str,
    pub remote_host: &'a str,
    pub remote_user: Option<&'a str>,
    pub method: &'a str,
    pub uri: &'a str,
    pub version: &'a str,
    pub status: u16,
    pub bytes: u64,
    pub referer: Option<&'a str>,
    pub user_agent: Option<&'a str>,
}

pub fn format_apache_line(fields: &AccessLogFields) -> String {
    let time = fmt_http_date(SystemTime::now());
    let bytes = if fields.bytes == 0 {
        "-".to_string()
    } else {
        fields.bytes.to_string()
    };
    format!(
        "{v} {h} - {u} [{t}] \"{method} {uri} {version}\" {status} {bytes} \"{referer}\" \"{ua}\"",
        v = fields.vhost,
        h = fields.remote_host,
        u = fields.remote_user.unwrap_or("-"),
        t = time,
        method = fields.method,
        uri = fields.uri,
        version = fields.version,
        status = fields.status,
        bytes = bytes,
        referer = fields.referer.unwrap_or("-"),
        ua = fields.user_agent.unwrap_or("-"),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn formats_dash_for_zero_bytes() {
        let fields = AccessLogFields {
            vhost: "all",
            remote_host: "127.0.0.1",
            remote_user: None,
            method: "GET",
            uri: "/",
            version: "HTTP/1.1",
            status: 304,
            bytes: 0,
            referer: None,
            user_agent: None,
        };
        let line = format_apache_line(&fields);
        assert!(line.contains(" 304 - "));
        assert!(line.contains("\"-\" \"-\""));
    }
}
