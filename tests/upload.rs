mod support;

use support::server::{self, Reply};
use weir::{
    HttpAdapter, Session,
    multipart::{Form, Part},
};

fn test_session() -> (Session, HttpAdapter) {
    let adapter = HttpAdapter::new();
    let session = Session::builder()
        .mount("http://", adapter.clone())
        .build()
        .unwrap();
    (session, adapter)
}

#[tokio::test]
async fn multipart_upload_with_exact_length() {
    let server = server::spawn(|req| {
        assert_eq!(req.method, "POST");
        let content_type = req.header("Content-Type").unwrap().to_owned();
        assert!(content_type.starts_with("multipart/form-data; boundary="));
        // exact length, never chunked
        assert!(req.header("Transfer-Encoding").is_none());
        assert_eq!(
            req.header("Content-Length").unwrap().parse::<usize>().unwrap(),
            req.body.len()
        );
        let body = req.body_str();
        assert!(body.contains("name=\"file\""));
        assert!(body.contains("test data\n"));
        Reply::ok().body("uploaded")
    })
    .await;

    let form = Form::new().part(
        Part::bytes("file", &b"test data\n"[..]).file_name("upload.txt"),
    );

    let (session, _) = test_session();
    let response = session
        .post(server.url("/post"))
        .multipart(form)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), weir::StatusCode::OK);
    assert_eq!(response.content().unwrap().as_ref(), b"uploaded");
    session.close().await;
}

#[tokio::test]
async fn multipart_file_part_from_disk() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("upload.txt");
    std::fs::write(&path, b"test data\n").unwrap();

    let server = server::spawn(|req| {
        let body = req.body_str();
        assert!(body.contains("filename=\"upload.txt\""));
        assert!(body.contains("Content-Type: text/plain"));
        assert!(body.contains("test data\n"));
        Reply::ok()
    })
    .await;

    let form = Form::new().part(Part::file("file", &path).await.unwrap());
    let (session, _) = test_session();
    let response = session
        .post(server.url("/post"))
        .multipart(form)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), weir::StatusCode::OK);
    session.close().await;
}

#[tokio::test]
async fn mixed_fields_and_files() {
    let server = server::spawn(|req| {
        let body = req.body_str();
        assert!(body.contains("name=\"kind\""));
        assert!(body.contains("plain value"));
        assert!(body.contains("name=\"blob\""));
        assert_eq!(
            req.header("Content-Length").unwrap().parse::<usize>().unwrap(),
            req.body.len()
        );
        Reply::ok()
    })
    .await;

    let form = Form::new()
        .text("kind", "plain value")
        .part(Part::bytes("blob", &b"\x00\x01\x02\x03"[..]).mime_str("application/octet-stream"));

    let (session, _) = test_session();
    let response = session
        .post(server.url("/post"))
        .multipart(form)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), weir::StatusCode::OK);
    session.close().await;
}

#[tokio::test]
async fn file_body_streams_with_content_length() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("data.bin");
    let payload: Vec<u8> = (0..100_000u32).map(|i| (i % 251) as u8).collect();
    std::fs::write(&path, &payload).unwrap();

    let expected = payload.clone();
    let server = server::spawn(move |req| {
        assert_eq!(
            req.header("Content-Length").unwrap().parse::<usize>().unwrap(),
            expected.len()
        );
        assert_eq!(req.body, expected);
        Reply::ok().body("received")
    })
    .await;

    let body = weir::Body::from_file(&path).await.unwrap();
    let (session, _) = test_session();
    let response = session
        .put(server.url("/upload"))
        .body(body)
        .send()
        .await
        .unwrap();
    assert_eq!(response.content().unwrap().as_ref(), b"received");
    session.close().await;
}

#[tokio::test]
async fn form_urlencoded_body() {
    let server = server::spawn(|req| {
        assert_eq!(
            req.header("Content-Type"),
            Some("application/x-www-form-urlencoded")
        );
        assert_eq!(req.body_str(), "hello=world&n=1");
        Reply::ok()
    })
    .await;

    let (session, _) = test_session();
    let response = session
        .post(server.url("/post"))
        .form(&[("hello", "world"), ("n", "1")])
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), weir::StatusCode::OK);
    session.close().await;
}
