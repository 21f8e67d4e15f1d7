pub const PART_BOUNDARY: &str = "123456789000000000000987654321";
pub const STREAM_CONTENT_TYPE: &str =
    "multipart/x-mixed-replace;boundary=123456789000000000000987654321";
pub const STREAM_BOUNDARY: &str = "\r\n--123456789000000000000987654321\r\n";

/// Header line sent ahead of each JPEG part.
pub fn part_header(len: usize) -> String {
    format!("Content-Type: image/jpeg\r\nContent-Length: {len}\r\n\r\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn constants_agree_on_boundary() {
        assert!(STREAM_CONTENT_TYPE.ends_with(PART_BOUNDARY));
        assert_eq!(STREAM_BOUNDARY, format!("\r\n--{PART_BOUNDARY}\r\n"));
    }

    #[test]
    fn header_carries_length() {
        assert_eq!(
            part_header(1234),
            "Content-Type: image/jpeg\r\nContent-Length: 1234\r\n\r\n"
        );
    }
}
