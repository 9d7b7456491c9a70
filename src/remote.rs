// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::{
    extent_map::ExtentHeader,
    id::SegmentId,
    volume::{SegmentAccess, SegmentSource, VolumeInfo},
    HashMap,
};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use md5::Digest;
use serde::{Deserialize, Serialize};
use std::{
    io::Read,
    sync::Mutex,
    time::{Duration, SystemTime},
};

const API_PREFIX: &str = "/api/v1/disk";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

fn now_unix() -> i64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

/// Maps a ureq failure onto the crate's error taxonomy.
fn http_err(err: ureq::Error, not_found: impl FnOnce() -> crate::Error) -> crate::Error {
    match err {
        ureq::Error::Status(code, resp) => {
            let body = resp.into_string().unwrap_or_default();
            match code {
                404 => not_found(),
                409 => crate::Error::Conflict(body),
                408 | 429 => crate::Error::Transient(format!("HTTP {code}: {body}")),
                code if code >= 500 => crate::Error::Transient(format!("HTTP {code}: {body}")),
                _ => crate::Error::Remote(code, body),
            }
        }
        ureq::Error::Transport(t) => crate::Error::Transient(t.to_string()),
    }
}

#[derive(Serialize)]
struct CreateVolumeBody<'a> {
    name: &'a str,
    size: u64,
    uuid: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    parent: Option<&'a str>,
}

#[derive(Deserialize)]
struct CreateVolumeResponse {
    volume_id: String,
    #[serde(default)]
    #[allow(unused)]
    version_id: Option<String>,
}

#[derive(Deserialize)]
struct RemoteVolume {
    volume_id: String,
    name: String,
    size: u64,
    uuid: String,
    #[serde(default)]
    parent: Option<String>,
}

#[derive(Deserialize)]
struct VolumeListResponse {
    volumes: Vec<RemoteVolume>,
    #[serde(default)]
    next_cursor: Option<String>,
}

#[derive(Deserialize)]
struct SegmentListLocation {
    url: String,
}

#[derive(Serialize)]
struct UploadRequest<'a> {
    lsvd_id: &'a str,
    volume_id: &'a str,
}

#[derive(Deserialize)]
struct UploadGrant {
    #[allow(unused)]
    segment_id: String,
    upload_url: String,
    completed_url: String,
    #[serde(default)]
    #[allow(unused)]
    expires_at: i64,
}

#[derive(Serialize)]
struct CompleteUploadBody {
    size: u64,
    md5: String,
    crc32c: String,
}

#[derive(Clone, Deserialize)]
struct DownloadGrant {
    download_url: String,
    expires_at: i64,
    size: u64,
    #[serde(default)]
    md5: Option<String>,
}

/// Segment store backed by the disk HTTP API.
///
/// Blobs themselves travel through presigned URLs; the API hands those
/// out and tracks which segments belong to which volume.
pub struct HttpVolume {
    agent: ureq::Agent,
    base: String,

    /// name -> volume_id, filled lazily from listings
    volume_ids: Mutex<HashMap<String, String>>,
}

impl HttpVolume {
    /// Creates a client against `base` (scheme + host, no trailing slash).
    ///
    /// Redirect following is disabled so the segment-listing 302 contract
    /// stays observable.
    #[must_use]
    pub fn new(base: &str) -> Self {
        Self {
            agent: ureq::AgentBuilder::new()
                .redirects(0)
                .timeout(REQUEST_TIMEOUT)
                .build(),
            base: base.trim_end_matches('/').to_string(),
            volume_ids: Mutex::new(HashMap::default()),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{API_PREFIX}{path}", self.base)
    }

    /// Resolves a URL the API returned, which may be relative to the base.
    fn resolve(&self, url: &str) -> String {
        if url.starts_with("http://") || url.starts_with("https://") {
            url.to_string()
        } else if url.starts_with('/') {
            format!("{}{url}", self.base)
        } else {
            format!("{}/{url}", self.base)
        }
    }

    fn volume_id(&self, name: &str) -> crate::Result<String> {
        if let Some(id) = self
            .volume_ids
            .lock()
            .expect("lock is poisoned")
            .get(name)
            .cloned()
        {
            return Ok(id);
        }

        let mut cursor: Option<String> = None;

        loop {
            let mut req = self.agent.get(&self.url("/volumes"));
            if let Some(c) = &cursor {
                req = req.query("cursor", c);
            }

            let listing: VolumeListResponse = req
                .call()
                .map_err(|e| http_err(e, || crate::Error::VolumeNotFound(name.into())))?
                .into_json()?;

            let mut ids = self.volume_ids.lock().expect("lock is poisoned");
            for volume in &listing.volumes {
                ids.insert(volume.name.clone(), volume.volume_id.clone());
            }
            if let Some(id) = ids.get(name).cloned() {
                return Ok(id);
            }
            drop(ids);

            match listing.next_cursor {
                Some(next) if !next.is_empty() => cursor = Some(next),
                _ => return Err(crate::Error::VolumeNotFound(name.into())),
            }
        }
    }

    fn fetch_segment_ids(&self, listing_url: &str) -> crate::Result<Vec<SegmentId>> {
        let names: Vec<String> = self
            .agent
            .get(&self.resolve(listing_url))
            .call()
            .map_err(|e| http_err(e, || crate::Error::Transient("listing URL vanished".into())))?
            .into_json()?;

        names.iter().map(|s| SegmentId::parse(s)).collect()
    }
}

impl SegmentAccess for HttpVolume {
    fn init_volume(&self, info: &VolumeInfo) -> crate::Result<VolumeInfo> {
        info.validate()?;

        let created: CreateVolumeResponse = self
            .agent
            .post(&self.url("/volumes"))
            .send_json(&CreateVolumeBody {
                name: &info.name,
                size: info.size,
                uuid: &info.uuid,
                parent: info.parent.as_deref(),
            })
            .map_err(|e| http_err(e, || crate::Error::VolumeNotFound(info.name.clone())))?
            .into_json()?;

        self.volume_ids
            .lock()
            .expect("lock is poisoned")
            .insert(info.name.clone(), created.volume_id);

        Ok(info.clone())
    }

    fn volume_info(&self, name: &str) -> crate::Result<VolumeInfo> {
        let id = self.volume_id(name)?;

        let remote: RemoteVolume = self
            .agent
            .get(&self.url(&format!("/volumes/{id}")))
            .call()
            .map_err(|e| http_err(e, || crate::Error::VolumeNotFound(name.into())))?
            .into_json()?;

        Ok(VolumeInfo {
            name: remote.name,
            size: remote.size,
            parent: remote.parent,
            uuid: remote.uuid,
        })
    }

    fn list_segments(&self, volume: &str) -> crate::Result<Vec<SegmentId>> {
        let id = self.volume_id(volume)?;

        let resp = self
            .agent
            .get(&self.url(&format!("/volumes/{id}/latest/segments")))
            .call()
            .map_err(|e| http_err(e, || crate::Error::VolumeNotFound(volume.into())))?;

        if resp.status() == 302 {
            if let Some(version) = resp.header("X-Volume-Version-Id") {
                log::trace!("volume {volume:?} listing at version {version}");
            }

            let location = resp
                .header("Location")
                .ok_or_else(|| crate::Error::Transient("302 without Location".into()))?
                .to_string();

            return self.fetch_segment_ids(&location);
        }

        let location: SegmentListLocation = resp.into_json()?;
        self.fetch_segment_ids(&location.url)
    }

    fn open_segment(&self, _volume: &str, id: SegmentId) -> crate::Result<Box<dyn SegmentSource>> {
        let grant = fetch_download_grant(&self.agent, &self.base, id)?;

        Ok(Box::new(HttpSegmentSource {
            agent: self.agent.clone(),
            base: self.base.clone(),
            id,
            len: grant.size,
            md5: grant.md5.as_deref().and_then(|m| BASE64.decode(m).ok()),
            grant: Mutex::new(grant),
        }))
    }

    fn new_segment(
        &self,
        volume: &str,
        id: SegmentId,
        data: &[u8],
        _layout: &[ExtentHeader],
    ) -> crate::Result<()> {
        let volume_id = self.volume_id(volume)?;

        let grant: UploadGrant = self
            .agent
            .post(&self.url("/segments/upload"))
            .send_json(&UploadRequest {
                lsvd_id: &id.to_string(),
                volume_id: &volume_id,
            })
            .map_err(|e| http_err(e, || crate::Error::VolumeNotFound(volume.into())))?
            .into_json()?;

        self.agent
            .put(&self.resolve(&grant.upload_url))
            .send_bytes(data)
            .map_err(|e| http_err(e, || crate::Error::Transient("upload URL vanished".into())))?;

        let md5 = BASE64.encode(md5::Md5::digest(data));
        let crc32c = BASE64.encode(crc32c::crc32c(data).to_be_bytes());

        self.agent
            .post(&self.resolve(&grant.completed_url))
            .send_json(&CompleteUploadBody {
                size: data.len() as u64,
                md5,
                crc32c,
            })
            .map_err(|e| http_err(e, || crate::Error::SegmentNotFound(id)))?;

        log::debug!("uploaded segment {id} ({} bytes)", data.len());
        Ok(())
    }

    fn remove_segment(&self, _volume: &str, id: SegmentId) -> crate::Result<()> {
        match self
            .agent
            .delete(&self.url(&format!("/segments/{id}")))
            .call()
        {
            Ok(_) => Ok(()),
            // Idempotent delete
            Err(ureq::Error::Status(404, _)) => Ok(()),
            Err(e) => Err(http_err(e, || crate::Error::SegmentNotFound(id))),
        }
    }
}

fn fetch_download_grant(
    agent: &ureq::Agent,
    base: &str,
    id: SegmentId,
) -> crate::Result<DownloadGrant> {
    agent
        .get(&format!("{base}{API_PREFIX}/segments/{id}/download"))
        .call()
        .map_err(|e| http_err(e, || crate::Error::SegmentNotFound(id)))?
        .into_json()
        .map_err(Into::into)
}

/// Ranged reads over one remote blob through a presigned URL.
///
/// The URL expires; reads refresh it when `expires_at` has passed or when
/// a request comes back retryable. The refresh is memoized under the
/// grant mutex so concurrent readers trigger it once.
struct HttpSegmentSource {
    agent: ureq::Agent,
    base: String,
    id: SegmentId,
    len: u64,
    md5: Option<Vec<u8>>,
    grant: Mutex<DownloadGrant>,
}

impl HttpSegmentSource {
    fn current_url(&self) -> crate::Result<String> {
        let mut grant = self.grant.lock().expect("lock is poisoned");

        if now_unix() > grant.expires_at {
            log::debug!("download URL of segment {} expired, refreshing", self.id);
            *grant = fetch_download_grant(&self.agent, &self.base, self.id)?;
        }

        Ok(grant.download_url.clone())
    }

    fn refresh(&self, stale_url: &str) -> crate::Result<String> {
        let mut grant = self.grant.lock().expect("lock is poisoned");

        // Another reader may have refreshed already
        if grant.download_url == stale_url {
            *grant = fetch_download_grant(&self.agent, &self.base, self.id)?;
        }

        Ok(grant.download_url.clone())
    }

    /// `Err(true)` marks failures worth one retry after a URL refresh.
    fn ranged_read(
        &self,
        url: &str,
        buf: &mut [u8],
        offset: u64,
    ) -> Result<(), (crate::Error, bool)> {
        let end = offset + buf.len() as u64 - 1;

        let resp = self
            .agent
            .get(url)
            .set("Range", &format!("bytes={offset}-{end}"))
            .call()
            .map_err(|e| {
                // Presigned URLs come back 403 once expired; transport
                // hiccups are worth one retry as well
                let retryable = matches!(
                    &e,
                    ureq::Error::Status(403, _) | ureq::Error::Transport(_),
                );
                (http_err(e, || crate::Error::SegmentNotFound(self.id)), retryable)
            })?;

        resp.into_reader()
            .read_exact(buf)
            .map_err(|e| (crate::Error::Transient(e.to_string()), true))
    }
}

impl SegmentSource for HttpSegmentSource {
    fn len(&self) -> u64 {
        self.len
    }

    fn read_at(&self, buf: &mut [u8], offset: u64) -> crate::Result<()> {
        if buf.is_empty() {
            return Ok(());
        }

        let url = self.current_url()?;

        match self.ranged_read(&url, buf, offset) {
            Ok(()) => Ok(()),
            Err((_, true)) => {
                let url = self.refresh(&url)?;
                self.ranged_read(&url, buf, offset).map_err(|(e, _)| e)
            }
            Err((e, false)) => Err(e),
        }
    }

    fn content_md5(&self) -> Option<Vec<u8>> {
        self.md5.clone()
    }
}
