//! Fixed gateway status tables.

/// Description used when the binary gateway returns a status outside the
/// table.
pub const UNKNOWN_APNS_STATUS: &str = "Unknown error. Possible pushd bug?";

/// Maps a binary gateway error-tuple status to its description.
pub fn apns_status_description(status: u8) -> &'static str {
    match status {
        1 => "Processing error",
        2 => "Missing device token",
        3 => "Missing topic",
        4 => "Missing payload",
        5 => "Missing token size",
        6 => "Missing topic size",
        7 => "Missing payload size",
        8 => "Invalid token",
        255 => "None (unknown error)",
        _ => UNKNOWN_APNS_STATUS,
    }
}

/// Reason phrase for an HTTP status code used in failure descriptions.
///
/// The table is fixed; codes it does not list have no phrase.
pub fn http_status_phrase(status: u16) -> Option<&'static str> {
    let phrase = match status {
        100 => "Continue",
        101 => "Switching Protocols",
        102 => "Processing",
        200 => "OK",
        201 => "Created",
        202 => "Accepted",
        203 => "Non-Authoritative Information",
        204 => "No Content",
        205 => "Reset Content",
        206 => "Partial Content",
        207 => "Multi-Status",
        226 => "IM Used",
        300 => "Multiple Choices",
        301 => "Moved Permanently",
        302 => "Found",
        303 => "See Other",
        304 => "Not Modified",
        305 => "Use Proxy",
        306 => "Reserved",
        307 => "Temporary Redirect",
        400 => "Bad Request",
        401 => "Unauthorized",
        402 => "Payment Required",
        403 => "Forbidden",
        404 => "Not Found",
        405 => "Method Not Allowed",
        406 => "Not Acceptable",
        407 => "Proxy Authentication Required",
        408 => "Request Timeout",
        409 => "Conflict",
        410 => "Gone",
        411 => "Length Required",
        412 => "Precondition Failed",
        413 => "Request Entity Too Large",
        414 => "Request-URI Too Long",
        415 => "Unsupported Media Type",
        416 => "Requested Range Not Satisfiable",
        417 => "Expectation Failed",
        418 => "I'm a Teapot",
        422 => "Unprocessable Entity",
        423 => "Locked",
        424 => "Failed Dependency",
        426 => "Upgrade Required",
        429 => "Too Many Requests",
        500 => "Internal Server Error",
        501 => "Not Implemented",
        502 => "Bad Gateway",
        503 => "Service Unavailable",
        504 => "Gateway Timeout",
        505 => "HTTP Version Not Supported",
        506 => "Variant Also Negotiates",
        507 => "Insufficient Storage",
        510 => "Not Extended",
        _ => return None,
    };
    Some(phrase)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_apns_statuses_are_described() {
        assert_eq!(apns_status_description(4), "Missing payload");
        assert_eq!(apns_status_description(8), "Invalid token");
        assert_eq!(apns_status_description(255), "None (unknown error)");
    }

    #[test]
    fn unknown_apns_status_is_generic() {
        assert_eq!(apns_status_description(42), UNKNOWN_APNS_STATUS);
        assert_eq!(apns_status_description(0), UNKNOWN_APNS_STATUS);
    }

    #[test]
    fn unknown_apns_status_names_the_daemon() {
        assert_eq!(apns_status_description(9), "Unknown error. Possible pushd bug?");
    }

    #[test]
    fn http_phrases_follow_the_fixed_table() {
        assert_eq!(http_status_phrase(404), Some("Not Found"));
        assert_eq!(http_status_phrase(429), Some("Too Many Requests"));
        assert_eq!(http_status_phrase(306), Some("Reserved"));
        assert_eq!(http_status_phrase(413), Some("Request Entity Too Large"));
        assert_eq!(http_status_phrase(414), Some("Request-URI Too Long"));
        assert_eq!(http_status_phrase(416), Some("Requested Range Not Satisfiable"));
        assert_eq!(http_status_phrase(418), Some("I'm a Teapot"));
        assert_eq!(http_status_phrase(510), Some("Not Extended"));
    }

    #[test]
    fn http_codes_outside_the_table_have_no_phrase() {
        for status in [42, 103, 299, 308, 421, 425, 428, 431, 451, 508, 511] {
            assert_eq!(http_status_phrase(status), None, "status {status}");
        }
    }
}
