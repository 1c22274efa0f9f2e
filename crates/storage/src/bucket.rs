//! [`StorageBackend`] for S3-compatible stores, on `aws-sdk-s3`.

use std::io;
use std::sync::{Arc, Mutex};

use aws_sdk_s3::config::http::HttpResponse;
use aws_sdk_s3::error::SdkError;
use aws_sdk_s3::primitives::{ByteStream, SdkBody};
use aws_sdk_s3::types::{CompletedMultipartUpload, CompletedPart};
use futures_util::StreamExt;
use http_body::Frame;
use http_body_util::StreamBody;
use objput_transfer::{
    PartResult, ProgressListener, ProgressTracker, READ_BUFFER_SIZE, RemoteObject, Transfer,
};
use tokio_util::io::ReaderStream;
use tracing::{debug, warn};

use crate::backend::{BackendFuture, MultipartUpload, PartBody, StorageBackend};
use crate::error::BackendError;

/// A bucket on an S3-compatible store.
///
/// Cheap to clone; clones share the underlying connection pool.
#[derive(Clone)]
pub struct Bucket {
    s3: aws_sdk_s3::Client,
    name: String,
}

impl Bucket {
    pub(crate) fn new(s3: aws_sdk_s3::Client, name: String) -> Self {
        Self { s3, name }
    }

    /// Bucket name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Sends `HEAD` on the bucket.
    pub(crate) async fn head(&self) -> Result<(), BackendError> {
        self.s3.head_bucket().bucket(&self.name).send().await?;
        Ok(())
    }
}

/// First error the local reader returned while a request body streamed.
///
/// The SDK only sees a failed body; the original `io::Error` is kept here so
/// the failure is reported as a local read error.
#[derive(Clone, Default)]
struct ReadFailure(Arc<Mutex<Option<io::Error>>>);

impl ReadFailure {
    fn record(&self, err: io::Error) -> io::Error {
        let forwarded = io::Error::new(err.kind(), err.to_string());
        let mut slot = self.0.lock().unwrap();
        if slot.is_none() {
            *slot = Some(err);
        }
        forwarded
    }

    fn take(&self) -> Option<io::Error> {
        self.0.lock().unwrap().take()
    }
}

/// Turns `body` into a streaming request body that reports progress to
/// `tracker` and records read errors in `failure`.
fn streaming_body(tracker: &ProgressTracker, body: PartBody, failure: ReadFailure) -> ByteStream {
    let reader = tracker.reader(body.into_reader());
    let frames = ReaderStream::with_capacity(reader, READ_BUFFER_SIZE).map(move |chunk| match chunk {
        Ok(bytes) => Ok(Frame::data(bytes)),
        Err(e) => Err(failure.record(e)),
    });
    ByteStream::new(SdkBody::from_body_1_x(StreamBody::new(frames)))
}

/// Resolves a streamed request to its ETag and emits the tracker's terminal
/// event. A local read error takes precedence over the SDK error it caused.
fn finish_transfer<E>(
    tracker: ProgressTracker,
    failure: &ReadFailure,
    sent: Result<Option<String>, SdkError<E, HttpResponse>>,
) -> Result<String, BackendError>
where
    BackendError: From<SdkError<E, HttpResponse>>,
{
    let result = match sent {
        Ok(Some(etag)) => Ok(etag),
        Ok(None) => Err(BackendError::InvalidResponse("missing ETag header".into())),
        Err(e) => Err(failure
            .take()
            .map(BackendError::Io)
            .unwrap_or_else(|| BackendError::from(e))),
    };
    match &result {
        Ok(_) => tracker.complete(),
        Err(_) => tracker.fail(),
    }
    result
}

fn content_length(size: u64) -> Result<i64, BackendError> {
    i64::try_from(size)
        .map_err(|_| BackendError::InvalidRequest(format!("body of {size} bytes is too large")))
}

impl StorageBackend for Bucket {
    fn put_whole<'a>(
        &'a self,
        key: &'a str,
        body: PartBody,
        listener: Arc<dyn ProgressListener>,
    ) -> BackendFuture<'a, RemoteObject> {
        Box::pin(async move {
            let size = body.size();
            let length = content_length(size)?;
            let tracker = ProgressTracker::start(listener, Transfer::Whole, size);
            let failure = ReadFailure::default();
            let stream = streaming_body(&tracker, body, failure.clone());

            let sent = self
                .s3
                .put_object()
                .bucket(&self.name)
                .key(key)
                .content_length(length)
                .body(stream)
                .send()
                .await
                .map(|out| out.e_tag);
            let etag = finish_transfer(tracker, &failure, sent)?;

            debug!(bucket = %self.name, key, size, "object uploaded");
            Ok(RemoteObject {
                key: key.to_string(),
                etag,
                size,
            })
        })
    }

    fn initiate_multipart<'a>(&'a self, key: &'a str) -> BackendFuture<'a, MultipartUpload> {
        Box::pin(async move {
            let out = self
                .s3
                .create_multipart_upload()
                .bucket(&self.name)
                .key(key)
                .send()
                .await?;
            let upload_id = out.upload_id.ok_or_else(|| {
                BackendError::InvalidResponse("initiate response has no UploadId".into())
            })?;
            debug!(bucket = %self.name, key, upload_id = %upload_id, "multipart upload initiated");
            Ok(MultipartUpload {
                key: key.to_string(),
                upload_id,
            })
        })
    }

    fn upload_part<'a>(
        &'a self,
        upload: &'a MultipartUpload,
        number: u32,
        body: PartBody,
        listener: Arc<dyn ProgressListener>,
    ) -> BackendFuture<'a, PartResult> {
        Box::pin(async move {
            let part_number = i32::try_from(number)
                .map_err(|_| BackendError::InvalidRequest(format!("part number {number}")))?;
            let length = content_length(body.size())?;
            let tracker = ProgressTracker::start(listener, Transfer::Part(number), body.size());
            let failure = ReadFailure::default();
            let stream = streaming_body(&tracker, body, failure.clone());

            let sent = self
                .s3
                .upload_part()
                .bucket(&self.name)
                .key(&upload.key)
                .upload_id(&upload.upload_id)
                .part_number(part_number)
                .content_length(length)
                .body(stream)
                .send()
                .await
                .map(|out| out.e_tag);
            let etag = finish_transfer(tracker, &failure, sent)?;
            Ok(PartResult { number, etag })
        })
    }

    fn complete_multipart<'a>(
        &'a self,
        upload: &'a MultipartUpload,
        parts: &'a [PartResult],
    ) -> BackendFuture<'a, RemoteObject> {
        Box::pin(async move {
            let mut completed = Vec::with_capacity(parts.len());
            for part in parts {
                let number = i32::try_from(part.number).map_err(|_| {
                    BackendError::InvalidRequest(format!("part number {}", part.number))
                })?;
                completed.push(
                    CompletedPart::builder()
                        .part_number(number)
                        .e_tag(&part.etag)
                        .build(),
                );
            }

            // The SDK turns an <Error> document sent with status 200 into an
            // error, so a returned output is a committed object.
            let out = self
                .s3
                .complete_multipart_upload()
                .bucket(&self.name)
                .key(&upload.key)
                .upload_id(&upload.upload_id)
                .multipart_upload(
                    CompletedMultipartUpload::builder()
                        .set_parts(Some(completed))
                        .build(),
                )
                .send()
                .await?;
            let etag = out.e_tag.ok_or_else(|| {
                BackendError::InvalidResponse("complete response has no ETag".into())
            })?;

            debug!(
                bucket = %self.name,
                key = %upload.key,
                parts = parts.len(),
                "multipart upload completed"
            );
            // The completion document does not carry the object size.
            Ok(RemoteObject {
                key: upload.key.clone(),
                etag,
                size: 0,
            })
        })
    }

    fn abort_multipart<'a>(&'a self, upload: &'a MultipartUpload) -> BackendFuture<'a, ()> {
        Box::pin(async move {
            let sent = self
                .s3
                .abort_multipart_upload()
                .bucket(&self.name)
                .key(&upload.key)
                .upload_id(&upload.upload_id)
                .send()
                .await;
            match sent.map_err(BackendError::from) {
                Ok(_) => {
                    debug!(key = %upload.key, upload_id = %upload.upload_id, "multipart upload aborted");
                    Ok(())
                }
                Err(BackendError::Api { status: 404, .. }) => {
                    warn!(key = %upload.key, upload_id = %upload.upload_id, "upload already gone");
                    Ok(())
                }
                Err(e) => Err(e),
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::{Client, Credentials};
    use httptest::{
        Expectation, Server, all_of,
        matchers::{contains, key, matches, request, url_decoded},
        responders::status_code,
    };
    use objput_transfer::{NoProgress, ProgressEvent};
    use std::pin::Pin;
    use std::task::{Context, Poll};
    use tokio::io::{AsyncRead, ReadBuf};

    fn bucket(server: &Server) -> Bucket {
        let endpoint = format!("http://{}", server.addr());
        Client::new(&endpoint, Credentials::new("id", "secret"))
            .unwrap()
            .with_path_style(true)
            .bucket_unchecked("media")
            .unwrap()
    }

    fn upload() -> MultipartUpload {
        MultipartUpload {
            key: "big.bin".into(),
            upload_id: "upload-1".into(),
        }
    }

    fn recorder() -> (Arc<Mutex<Vec<ProgressEvent>>>, Arc<dyn ProgressListener>) {
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&events);
        let listener: Arc<dyn ProgressListener> =
            Arc::new(move |e: &ProgressEvent| sink.lock().unwrap().push(*e));
        (events, listener)
    }

    /// Yields a few bytes, then fails like a disk that went away.
    struct FailingDisk {
        served: bool,
    }

    impl AsyncRead for FailingDisk {
        fn poll_read(
            mut self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            buf: &mut ReadBuf<'_>,
        ) -> Poll<io::Result<()>> {
            if self.served {
                return Poll::Ready(Err(io::Error::other("disk read failed")));
            }
            self.served = true;
            buf.put_slice(b"abc");
            Poll::Ready(Ok(()))
        }
    }

    #[tokio::test]
    async fn put_whole_streams_body_and_reports_progress() {
        let server = Server::run();
        server.expect(
            Expectation::matching(all_of![
                request::method_path("PUT", "/media/small.txt"),
                request::body("hello world"),
            ])
            .respond_with(status_code(200).insert_header("ETag", "\"5eb63bbb\"")),
        );

        let (events, listener) = recorder();
        let object = bucket(&server)
            .put_whole("small.txt", PartBody::from_bytes(b"hello world".to_vec()), listener)
            .await
            .unwrap();
        assert_eq!(object.etag, "\"5eb63bbb\"");
        assert_eq!(object.size, 11);

        let events = events.lock().unwrap();
        assert!(matches!(events.first(), Some(ProgressEvent::Started(_))));
        match events.last() {
            Some(ProgressEvent::Completed(s)) => assert_eq!(s.consumed_bytes, 11),
            other => panic!("unexpected last event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn put_whole_maps_error_document() {
        let server = Server::run();
        server.expect(
            Expectation::matching(request::method_path("PUT", "/media/denied.txt")).respond_with(
                status_code(403).body(
                    "<Error><Code>AccessDenied</Code><Message>Access Denied</Message></Error>",
                ),
            ),
        );

        let err = bucket(&server)
            .put_whole("denied.txt", PartBody::from_bytes(b"x".to_vec()), Arc::new(NoProgress))
            .await
            .unwrap_err();
        match err {
            BackendError::Api {
                status,
                code,
                message,
            } => {
                assert_eq!(status, 403);
                assert_eq!(code, "AccessDenied");
                assert_eq!(message, "Access Denied");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn local_read_failure_is_io_error() {
        let server = Server::run();
        server.expect(
            Expectation::matching(request::method_path("PUT", "/media/big.bin"))
                .times(0..)
                .respond_with(status_code(200).insert_header("ETag", "\"never\"")),
        );

        let (events, listener) = recorder();
        let err = bucket(&server)
            .upload_part(
                &upload(),
                1,
                PartBody::new(FailingDisk { served: false }, 10),
                listener,
            )
            .await
            .unwrap_err();

        match &err {
            BackendError::Io(e) => assert_eq!(e.to_string(), "disk read failed"),
            other => panic!("unexpected error: {other:?}"),
        }
        assert!(!err.is_transient());
        assert!(matches!(
            events.lock().unwrap().last(),
            Some(ProgressEvent::Failed(_))
        ));
    }

    #[tokio::test]
    async fn initiate_parses_upload_id() {
        let server = Server::run();
        server.expect(
            Expectation::matching(all_of![
                request::method_path("POST", "/media/big.bin"),
                request::query(url_decoded(contains(key("uploads")))),
            ])
            .respond_with(status_code(200).body(
                "<InitiateMultipartUploadResult><Bucket>media</Bucket><Key>big.bin</Key>\
                 <UploadId>upload-1</UploadId></InitiateMultipartUploadResult>",
            )),
        );

        let upload = bucket(&server).initiate_multipart("big.bin").await.unwrap();
        assert_eq!(upload.key, "big.bin");
        assert_eq!(upload.upload_id, "upload-1");
    }

    #[tokio::test]
    async fn initiate_without_upload_id_is_invalid() {
        let server = Server::run();
        server.expect(
            Expectation::matching(request::method_path("POST", "/media/big.bin")).respond_with(
                status_code(200).body(
                    "<InitiateMultipartUploadResult><Bucket>media</Bucket>\
                     <Key>big.bin</Key></InitiateMultipartUploadResult>",
                ),
            ),
        );

        let err = bucket(&server).initiate_multipart("big.bin").await.unwrap_err();
        assert!(matches!(err, BackendError::InvalidResponse(_)));
    }

    #[tokio::test]
    async fn upload_part_sends_number_and_upload_id() {
        let server = Server::run();
        server.expect(
            Expectation::matching(all_of![
                request::method_path("PUT", "/media/big.bin"),
                request::query(url_decoded(contains(("partNumber", "2")))),
                request::query(url_decoded(contains(("uploadId", "upload-1")))),
                request::body("part-two"),
            ])
            .respond_with(status_code(200).insert_header("ETag", "\"e2\"")),
        );

        let result = bucket(&server)
            .upload_part(
                &upload(),
                2,
                PartBody::from_bytes(b"part-two".to_vec()),
                Arc::new(NoProgress),
            )
            .await
            .unwrap();
        assert_eq!(
            result,
            PartResult {
                number: 2,
                etag: "\"e2\"".into()
            }
        );
    }

    #[tokio::test]
    async fn upload_part_without_etag_fails_progress() {
        let server = Server::run();
        server.expect(
            Expectation::matching(request::method_path("PUT", "/media/big.bin"))
                .respond_with(status_code(200)),
        );

        let (events, listener) = recorder();
        let err = bucket(&server)
            .upload_part(&upload(), 1, PartBody::from_bytes(b"abc".to_vec()), listener)
            .await
            .unwrap_err();
        assert!(matches!(err, BackendError::InvalidResponse(_)));
        assert!(matches!(
            events.lock().unwrap().last(),
            Some(ProgressEvent::Failed(_))
        ));
    }

    #[tokio::test]
    async fn complete_sends_sorted_part_list() {
        let server = Server::run();
        server.expect(
            Expectation::matching(all_of![
                request::method_path("POST", "/media/big.bin"),
                request::query(url_decoded(contains(("uploadId", "upload-1")))),
                request::body(matches(
                    "<PartNumber>1</PartNumber>.*<PartNumber>2</PartNumber>"
                )),
            ])
            .respond_with(status_code(200).body(
                "<CompleteMultipartUploadResult><Key>big.bin</Key>\
                 <ETag>&quot;abc-2&quot;</ETag></CompleteMultipartUploadResult>",
            )),
        );

        let parts = vec![
            PartResult {
                number: 1,
                etag: "\"e1\"".into(),
            },
            PartResult {
                number: 2,
                etag: "\"e2\"".into(),
            },
        ];
        let object = bucket(&server)
            .complete_multipart(&upload(), &parts)
            .await
            .unwrap();
        assert_eq!(object.key, "big.bin");
        assert_eq!(object.etag, "\"abc-2\"");
    }

    #[tokio::test]
    async fn complete_decodes_numeric_character_references() {
        let server = Server::run();
        server.expect(
            Expectation::matching(request::method_path("POST", "/media/big.bin")).respond_with(
                status_code(200).body(
                    "<CompleteMultipartUploadResult><Key>big.bin</Key>\
                     <ETag>&#34;abc-3&#34;</ETag></CompleteMultipartUploadResult>",
                ),
            ),
        );

        let parts = [PartResult {
            number: 1,
            etag: "\"e1\"".into(),
        }];
        let object = bucket(&server)
            .complete_multipart(&upload(), &parts)
            .await
            .unwrap();
        assert_eq!(object.etag, "\"abc-3\"");
    }

    #[tokio::test]
    async fn complete_detects_error_in_ok_response() {
        let server = Server::run();
        server.expect(
            Expectation::matching(request::method_path("POST", "/media/big.bin")).respond_with(
                status_code(200).body(
                    "<Error><Code>InternalError</Code><Message>try again</Message></Error>",
                ),
            ),
        );

        let parts = [PartResult {
            number: 1,
            etag: "\"e1\"".into(),
        }];
        let err = bucket(&server)
            .complete_multipart(&upload(), &parts)
            .await
            .unwrap_err();
        assert!(err.is_transient());
        assert!(err.to_string().contains("InternalError"));
    }

    #[tokio::test]
    async fn abort_tolerates_missing_upload() {
        let server = Server::run();
        server.expect(
            Expectation::matching(all_of![
                request::method_path("DELETE", "/media/big.bin"),
                request::query(url_decoded(contains(("uploadId", "upload-1")))),
            ])
            .times(2)
            .respond_with(httptest::cycle![
                status_code(204),
                status_code(404).body(
                    "<Error><Code>NoSuchUpload</Code><Message>gone</Message></Error>"
                ),
            ]),
        );

        let bucket = bucket(&server);
        bucket.abort_multipart(&upload()).await.unwrap();
        bucket.abort_multipart(&upload()).await.unwrap();
    }
}
