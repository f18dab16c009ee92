//! `multipart/x-mixed-replace` framing for MJPEG responses.

use bytes::{BufMut, Bytes, BytesMut};

pub fn content_type(boundary: &str) -> String {
    format!("multipart/x-mixed-replace;boundary=\"{}\"", boundary)
}

/// One body part carrying a JPEG.
pub fn part(boundary: &str, jpeg: &[u8]) -> Bytes {
    let head = format!(
        "--{}\r\nContent-Type: image/jpeg\r\nContent-Length: {}\r\n\r\n",
        boundary,
        jpeg.len()
    );
    let mut buf = BytesMut::with_capacity(head.len() + jpeg.len() + 2);
    buf.put_slice(head.as_bytes());
    buf.put_slice(jpeg);
    buf.put_slice(b"\r\n");
    buf.freeze()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::mjpeg::{boundary_from_content_type, PartSplitter};

    #[test]
    fn parts_split_back_into_jpegs() {
        let boundary = "frame";
        let mut splitter = PartSplitter::new(
            &boundary_from_content_type(&content_type(boundary)).unwrap(),
        );
        splitter.push(&part(boundary, b"\xFF\xD8one\xFF\xD9"));
        splitter.push(&part(boundary, b"\xFF\xD8two\xFF\xD9"));
        splitter.push(b"--frame");

        assert_eq!(&splitter.next_part().unwrap()[..], b"\xFF\xD8one\xFF\xD9");
        assert_eq!(&splitter.next_part().unwrap()[..], b"\xFF\xD8two\xFF\xD9");
    }

    #[test]
    fn part_layout() {
        let p = part("b", b"jpg");
        assert_eq!(
            &p[..],
            b"--b\r\nContent-Type: image/jpeg\r\nContent-Length: 3\r\n\r\njpg\r\n"
        );
    }
}
