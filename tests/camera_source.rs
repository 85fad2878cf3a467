use std::io::{Read, Write};
use std::net::TcpListener;
use std::thread::JoinHandle;

use image::{Rgb, RgbImage};

use ppe_monitor::config::CameraSettings;
use ppe_monitor::ingest::open_source;
use ppe_monitor::overlay::encode_jpeg;

fn jpeg(width: u32, height: u32) -> Vec<u8> {
    encode_jpeg(&RgbImage::from_pixel(width, height, Rgb([40, 90, 160])), 80).expect("jpeg")
}

/// Answers `requests` GETs with `content_type` and `body`, closing each
/// connection after the body.
fn serve(content_type: &'static str, body: Vec<u8>, requests: usize) -> (String, JoinHandle<()>) {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
    let url = format!("http://{}/stream", listener.local_addr().expect("addr"));
    let thread = std::thread::spawn(move || {
        for _ in 0..requests {
            answer(&listener, content_type, &body);
        }
    });
    (url, thread)
}

fn answer(listener: &TcpListener, content_type: &str, body: &[u8]) {
    let (mut stream, _) = listener.accept().expect("accept");
    let mut request = Vec::new();
    let mut buf = [0u8; 1024];
    while !request.windows(4).any(|w| w == b"\r\n\r\n") {
        let n = stream.read(&mut buf).expect("read request");
        if n == 0 {
            return;
        }
        request.extend_from_slice(&buf[..n]);
    }
    let head = format!(
        "HTTP/1.1 200 OK\r\nContent-Type: {}\r\nConnection: close\r\n\r\n",
        content_type
    );
    let _ = stream.write_all(head.as_bytes());
    let _ = stream.write_all(body);
}

fn camera(url: &str, max_frame_bytes: usize) -> CameraSettings {
    CameraSettings {
        url: url.to_string(),
        camera_id: None,
        domain_id: None,
        target_fps: 0,
        width: 0,
        height: 0,
        max_frame_bytes,
    }
}

#[test]
fn multipart_camera_yields_frames_until_a_part_is_too_large() {
    let first = jpeg(16, 8);
    let second = jpeg(24, 12);
    let mut body = Vec::new();
    body.extend_from_slice(
        format!("--frame\r\nContent-Type: image/jpeg\r\nContent-Length: {}\r\n\r\n", first.len()).as_bytes(),
    );
    body.extend_from_slice(&first);
    body.extend_from_slice(b"\r\n--frame\r\nContent-Type: image/jpeg\r\n\r\n");
    body.extend_from_slice(&second);
    body.extend_from_slice(b"\r\n--frame\r\nContent-Type: image/jpeg\r\nContent-Length: 10000000\r\n\r\n");

    let (url, server) = serve("multipart/x-mixed-replace; boundary=frame", body, 1);
    let mut source = open_source(&camera(&url, 64 * 1024)).expect("source");
    source.connect().expect("connect");
    assert!(source.is_healthy());

    let frame = source.next_frame().expect("first frame");
    assert_eq!((frame.width, frame.height), (16, 8));
    let frame = source.next_frame().expect("second frame");
    assert_eq!((frame.width, frame.height), (24, 12));

    assert!(source.next_frame().is_err());
    assert!(!source.is_healthy());
    assert_eq!(source.frames_captured(), 2);
    source.release();
    server.join().expect("server");
}

#[test]
fn snapshot_larger_than_the_limit_is_rejected() {
    let (url, server) = serve("image/jpeg", jpeg(64, 64), 2);
    let mut source = open_source(&camera(&url, 64)).expect("source");
    // connect() only learns the content type; the frame is fetched again.
    source.connect().expect("connect");
    let err = source.next_frame().expect_err("oversized snapshot");
    assert!(format!("{:#}", err).contains("frame limit"), "{:#}", err);
    assert!(!source.is_healthy());
    server.join().expect("server");
}
