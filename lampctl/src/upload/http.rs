use std::{
    io::{self, Cursor, Read},
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use reqwest::{blocking::Body, header};

use super::{UploadError, UploadProgress, UploadSession};

/// Callback receiving normalized progress snapshots during an upload.
///
/// `Send + 'static` because the request body is handed to the HTTP client,
/// which may read it off-thread.
pub type UploadProgressFn = dyn FnMut(UploadProgress) + Send;

const BOUNDARY: &str = "----lampctl-firmware-upload";
const FORM_FIELD: &str = "uploaded_file";

fn lock(session: &Mutex<UploadSession>) -> MutexGuard<'_, UploadSession> {
    session.lock().unwrap_or_else(PoisonError::into_inner)
}

fn multipart_frame() -> (Vec<u8>, Vec<u8>) {
    let prologue = format!(
        "--{BOUNDARY}\r\n\
         Content-Disposition: form-data; name=\"{FORM_FIELD}\"; filename=\"firmware.bin\"\r\n\
         Content-Type: application/octet-stream\r\n\r\n"
    )
    .into_bytes();
    let epilogue = format!("\r\n--{BOUNDARY}--\r\n").into_bytes();
    (prologue, epilogue)
}

/// Wraps the whole request body and feeds cumulative byte counts into the
/// session, so reported progress includes the multipart overhead the
/// session is built to subtract.
struct CountingReader<R> {
    inner: R,
    count: u64,
    body_len: u64,
    session: Arc<Mutex<UploadSession>>,
    progress: Option<Box<UploadProgressFn>>,
}

impl<R: Read> Read for CountingReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        if n > 0 {
            self.count += n as u64;
            let snapshot = lock(&self.session).record_progress(self.count, self.body_len);
            if let Some(progress) = &mut self.progress {
                progress(snapshot);
            }
        }
        Ok(n)
    }
}

/// Streams firmware images to the bridge's `/update` endpoint.
pub struct HttpUploader {
    base_url: String,
    http: reqwest::blocking::Client,
}

impl HttpUploader {
    /// Creates an uploader for the given base URL, e.g.
    /// `http://192.168.4.1`.
    ///
    /// `timeout` bounds the whole exchange; `None` leaves the transfer
    /// unbounded, which large images over a slow link may need.
    pub fn new(base_url: impl Into<String>, timeout: Option<Duration>) -> Result<Self, UploadError> {
        let http = reqwest::blocking::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|err| UploadError::Transport(Box::new(err)))?;

        let mut base_url = base_url.into();
        while base_url.ends_with('/') {
            base_url.pop();
        }

        Ok(Self { base_url, http })
    }

    /// Streams the firmware to the device and finalizes the session.
    ///
    /// Returns the device's response body on success. The session reaches
    /// a terminal state in every case before this returns.
    pub fn upload<R: Read + Send + 'static>(
        &self,
        session: &Arc<Mutex<UploadSession>>,
        firmware: R,
        progress: Option<Box<UploadProgressFn>>,
    ) -> Result<String, UploadError> {
        let declared_size = lock(session).declared_size();

        let (prologue, epilogue) = multipart_frame();
        let body_len = prologue.len() as u64 + declared_size + epilogue.len() as u64;

        let reader = CountingReader {
            inner: Cursor::new(prologue)
                .chain(firmware.take(declared_size))
                .chain(Cursor::new(epilogue)),
            count: 0,
            body_len,
            session: Arc::clone(session),
            progress,
        };

        log::info!("uploading {declared_size} bytes to {}/update", self.base_url);

        let response = self
            .http
            .post(format!("{}/update", self.base_url))
            .query(&[("file_size", declared_size)])
            .header(
                header::CONTENT_TYPE,
                format!("multipart/form-data; boundary={BOUNDARY}"),
            )
            .body(Body::sized(reader, body_len))
            .send()
            .and_then(|response| response.text());

        match response {
            Ok(body) => {
                lock(session).complete(&body)?;
                Ok(body)
            }
            Err(err) => {
                lock(session).fail();
                Err(UploadError::Transport(Box::new(err)))
            }
        }
    }

    /// Reboots the ESP bridge itself via `POST /reboot_esp`.
    ///
    /// The maintenance endpoints live on the same HTTP server as the
    /// firmware upload. The message channel drops while the bridge
    /// restarts.
    pub fn reboot_esp(&self) -> Result<String, UploadError> {
        self.post_empty("/reboot_esp")
    }

    /// Clears the bridge's stored WiFi credentials via
    /// `POST /reset_wifi_settings`.
    ///
    /// The bridge reboots into its `SAD-Lamp_AP` configuration access
    /// point afterwards.
    pub fn reset_wifi_settings(&self) -> Result<String, UploadError> {
        self.post_empty("/reset_wifi_settings")
    }

    fn post_empty(&self, path: &str) -> Result<String, UploadError> {
        log::info!("POST {}{path}", self.base_url);
        self.http
            .post(format!("{}{path}", self.base_url))
            .send()
            .and_then(|response| response.text())
            .map_err(|err| UploadError::Transport(Box::new(err)))
    }
}

#[cfg(test)]
mod tests {
    use crate::upload::UploadState;

    use super::*;

    #[test]
    fn body_framing_wraps_the_file() {
        let (prologue, epilogue) = multipart_frame();
        let prologue = String::from_utf8(prologue).unwrap();
        let epilogue = String::from_utf8(epilogue).unwrap();

        assert!(prologue.starts_with("--"));
        assert!(prologue.contains("name=\"uploaded_file\""));
        assert!(prologue.ends_with("\r\n\r\n"));
        assert!(epilogue.contains(BOUNDARY));
        assert!(epilogue.ends_with("--\r\n"));
    }

    #[test]
    fn counting_reader_drives_the_session() {
        let payload = vec![0u8; 1000];
        let (prologue, epilogue) = multipart_frame();
        let overhead = (prologue.len() + epilogue.len()) as u64;
        let body_len = overhead + payload.len() as u64;

        let session = Arc::new(Mutex::new(UploadSession::new(payload.len() as u64)));
        let snapshots = Arc::new(Mutex::new(Vec::new()));

        let recorded = Arc::clone(&snapshots);
        let mut reader = CountingReader {
            inner: Cursor::new(prologue)
                .chain(Cursor::new(payload).take(1000))
                .chain(Cursor::new(epilogue)),
            count: 0,
            body_len,
            session: Arc::clone(&session),
            progress: Some(Box::new(move |progress| {
                recorded.lock().unwrap().push(progress);
            })),
        };

        let mut sink = Vec::new();
        let total = reader.read_to_end(&mut sink).unwrap();
        assert_eq!(total as u64, body_len);

        let snapshots = snapshots.lock().unwrap();
        let last = snapshots.last().unwrap();
        assert_eq!(last.file_bytes, 1000);
        assert_eq!(last.percent, 100);

        let session = session.lock().unwrap();
        assert_eq!(session.transferred(), 1000);
        assert_eq!(session.state(), UploadState::InProgress);
    }
}
