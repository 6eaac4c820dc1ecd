//! Payloads sent back when a stream cannot be routed to a backend.

/// A fatal TLS `access_denied` alert record. Clients speaking TLS get this
/// instead of an HTML page they could not display.
pub const TLS_REJECTION: &[u8] = &[0x15, 0x03, 0x01, 0x00, 0x02, 0x02, 0x31];

const FANCY_PRE: &str = "<html><frameset cols='*'><frame target='_top' \
    src='https://pagekite.net/offline/?&where=%W&v=%V&proto=%P&domain=%D'>\
    <noframes>";
const FANCY_POST: &str = "</noframes></frameset></html>";

/// HTML 503 page naming the unavailable kite.
pub fn html_rejection(app_id: &str, proto: &str, host: &str, fancy: bool) -> String {
    let (pre, post) = if fancy {
        let pre = FANCY_PRE
            .replace("%W", "BE")
            .replace("%V", app_id)
            .replace("%P", proto)
            .replace("%D", host);
        (pre, FANCY_POST)
    } else {
        (String::new(), "")
    };
    format!(
        "HTTP/1.1 503 Unavailable\r\n\
         Content-Type: text/html; charset=utf-8\r\n\
         Pragma: no-cache\r\n\
         Expires: 0\r\n\
         Cache-Control: no-store\r\n\
         Connection: close\r\n\
         \r\n\
         {pre}<h1>Sorry! (be/{app_id})</h1>\
         <p>The {proto} <a href='http://pagekite.net/'><i>PageKite</i></a> \
         for <b>{host}</b> is unavailable at the moment.</p>\
         <p>Please try again later.</p>{post}"
    )
}

/// Protocol-appropriate rejection payload for a stream request.
pub fn rejection_payload(proto: &str, host: &str, app_id: &str, fancy: bool) -> Vec<u8> {
    if proto.get(..5).is_some_and(|p| p.eq_ignore_ascii_case("https")) {
        TLS_REJECTION.to_vec()
    } else {
        html_rejection(app_id, proto, host, fancy).into_bytes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tls_requests_get_alert_record() {
        assert_eq!(
            rejection_payload("HTTPS", "x.example.com", "km", false),
            TLS_REJECTION
        );
    }

    #[test]
    fn plain_requests_get_html() {
        let page = String::from_utf8(rejection_payload("http", "x.example.com", "km", false))
            .unwrap_or_default();
        assert!(page.starts_with("HTTP/1.1 503"));
        assert!(page.contains("x.example.com"));
        assert!(!page.contains("<frameset"));
    }

    #[test]
    fn fancy_page_is_framed() {
        let page = html_rejection("km", "http", "x.example.com", true);
        assert!(page.contains("where=BE&v=km&proto=http&domain=x.example.com"));
        assert!(page.ends_with("</noframes></frameset></html>"));
    }
}
