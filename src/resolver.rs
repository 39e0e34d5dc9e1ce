//! Turns user-supplied media references (paths or URLs) into something a
//! cast device can fetch.
//!
//! Remote http(s) URLs pass through untouched; the device dereferences
//! them itself. Local paths are checked for existence and later exposed
//! through the embedded file server. Content types come from a fixed
//! extension table, never from sniffing; an unknown extension is an error
//! the user resolves with an explicit MIME type.

use crate::{payload::media, Error};
use std::{
    net::{IpAddr, SocketAddr, UdpSocket},
    path::{Path, PathBuf},
};

/// URL path the embedded server exposes the main content under.
pub const VIDEO_ROUTE: &str = "/video";

/// URL path the embedded server exposes the subtitle file under.
pub const SUBTITLES_ROUTE: &str = "/subtitles";

pub const SUBTITLE_TRACK_ID: media::TrackId = 1;

/// A media reference after classification.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Source {
    /// http(s) URL the device fetches directly.
    Remote {
        url: String,
        content_type: String,
    },

    /// Existing local file to serve to the device.
    Local {
        path: PathBuf,
        content_type: String,
    },
}

impl Source {
    pub fn content_type(&self) -> &str {
        match self {
            Source::Remote { content_type, .. } => content_type,
            Source::Local { content_type, .. } => content_type,
        }
    }

    pub fn local_path(&self) -> Option<&Path> {
        match self {
            Source::Remote { .. } => None,
            Source::Local { path, .. } => Some(path),
        }
    }
}

/// Final URLs for one LOAD request, after any local files got a server
/// address assigned.
#[derive(Clone, Debug)]
pub struct MediaPlan {
    pub content_url: String,
    pub content_type: String,

    pub subtitles: Option<SubtitleRef>,
}

#[derive(Clone, Debug)]
pub struct SubtitleRef {
    pub url: String,
    pub content_type: String,
}

impl MediaPlan {
    pub fn to_media(&self, title: Option<String>) -> media::Media {
        media::Media {
            content_id: self.content_url.clone(),
            stream_type: media::STREAM_TYPE_BUFFERED.to_string(),
            content_type: self.content_type.clone(),
            metadata: title.map(|title| media::Metadata {
                // Generic media metadata.
                metadata_type: 0,
                title: Some(title),
                subtitle: None,
            }),
            duration: None,
            tracks: self.subtitles.as_ref().map(|subs| vec![
                media::Track::subtitles(SUBTITLE_TRACK_ID,
                                        subs.url.clone(),
                                        subs.content_type.clone()),
            ]),
        }
    }

    pub fn active_track_ids(&self) -> Option<Vec<media::TrackId>> {
        self.subtitles.as_ref().map(|_| vec![SUBTITLE_TRACK_ID])
    }
}

/// Classifies the main content reference.
pub fn resolve_media(input: &str, explicit_type: Option<&str>) -> crate::Result<Source> {
    resolve(input, explicit_type, media_type_for_extension)
}

/// Classifies a subtitle reference.
pub fn resolve_subtitles(input: &str, explicit_type: Option<&str>) -> crate::Result<Source> {
    resolve(input, explicit_type, subtitle_type_for_extension)
}

fn resolve(input: &str,
           explicit_type: Option<&str>,
           type_for_extension: fn(&str) -> Option<&'static str>)
-> crate::Result<Source>
{
    if let Some((scheme, _rest)) = input.split_once("://") {
        if !scheme.eq_ignore_ascii_case("http") && !scheme.eq_ignore_ascii_case("https") {
            return Err(Error::UnsupportedFormat { input: input.to_string() });
        }

        let content_type = match explicit_type {
            Some(t) => t.to_string(),
            None => url_content_type(input, type_for_extension)
                .ok_or_else(|| Error::UnsupportedFormat { input: input.to_string() })?
                .to_string(),
        };

        return Ok(Source::Remote {
            url: input.to_string(),
            content_type,
        });
    }

    let path = PathBuf::from(input);
    if !path.is_file() {
        return Err(Error::FileNotFound { path });
    }

    let content_type = match explicit_type {
        Some(t) => t.to_string(),
        None => path_content_type(&path, type_for_extension)
            .ok_or_else(|| Error::UnsupportedFormat { input: input.to_string() })?
            .to_string(),
    };

    Ok(Source::Local { path, content_type })
}

fn path_content_type(path: &Path,
                     type_for_extension: fn(&str) -> Option<&'static str>)
-> Option<&'static str>
{
    let ext = path.extension()?.to_str()?.to_ascii_lowercase();
    type_for_extension(&ext)
}

fn url_content_type(url: &str,
                    type_for_extension: fn(&str) -> Option<&'static str>)
-> Option<&'static str>
{
    // Extension of the URL path, ignoring query and fragment.
    let without_fragment = url.split('#').next().unwrap_or(url);
    let without_query = without_fragment.split('?').next().unwrap_or(without_fragment);
    path_content_type(Path::new(without_query), type_for_extension)
}

fn media_type_for_extension(ext: &str) -> Option<&'static str> {
    Some(match ext {
        "mp4" => "video/mp4",
        "m4v" => "video/x-m4v",
        "webm" => "video/webm",
        "mkv" => "video/x-matroska",
        "avi" => "video/x-msvideo",
        "mov" => "video/quicktime",
        "mpg" | "mpeg" => "video/mpeg",
        "ts" => "video/mp2t",
        "ogv" => "video/ogg",

        "mp3" => "audio/mpeg",
        "m4a" => "audio/mp4",
        "aac" => "audio/aac",
        "flac" => "audio/flac",
        "ogg" => "audio/ogg",
        "opus" => "audio/opus",
        "wav" => "audio/wav",

        _ => return None,
    })
}

fn subtitle_type_for_extension(ext: &str) -> Option<&'static str> {
    Some(match ext {
        "vtt" => "text/vtt",
        "srt" => "application/x-subrip",
        "ttml" => "application/ttml+xml",

        _ => return None,
    })
}

/// Local address the device can reach us on, found by opening a UDP
/// socket towards the device. Nothing is actually sent.
pub fn local_ip_for(device_ip: IpAddr) -> crate::Result<IpAddr> {
    let bind_addr = match device_ip {
        IpAddr::V4(_) => SocketAddr::from(([0, 0, 0, 0], 0)),
        IpAddr::V6(_) => SocketAddr::from(([0, 0, 0, 0, 0, 0, 0, 0], 0)),
    };

    let probe = || -> std::io::Result<IpAddr> {
        let socket = UdpSocket::bind(bind_addr)?;
        socket.connect(SocketAddr::new(device_ip, 9))?;
        Ok(socket.local_addr()?.ip())
    };

    let ip = probe().map_err(Error::NetworkUnreachable)?;

    // A loopback address is useless to the device; advertising one would
    // make it fetch from itself.
    if ip.is_loopback() {
        return Err(Error::NetworkUnreachable(std::io::Error::other(
            "local route to the device resolves to a loopback address")));
    }

    Ok(ip)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn remote_http_url_passes_through() {
        let source = resolve_media("http://example.com/films/big_buck_bunny.mp4", None)
            .unwrap();
        assert_eq!(source, Source::Remote {
            url: "http://example.com/films/big_buck_bunny.mp4".to_string(),
            content_type: "video/mp4".to_string(),
        });
    }

    #[test]
    fn url_extension_ignores_query_and_fragment() {
        let source = resolve_media("https://example.com/clip.webm?token=abc#t=30", None)
            .unwrap();
        assert_eq!(source.content_type(), "video/webm");
    }

    #[test]
    fn non_http_scheme_is_unsupported() {
        let err = resolve_media("rtsp://example.com/stream.mp4", None).unwrap_err();
        assert!(matches!(err, Error::UnsupportedFormat { .. }));

        let err = resolve_media("file:///tmp/a.mp4", None).unwrap_err();
        assert!(matches!(err, Error::UnsupportedFormat { .. }));
    }

    #[test]
    fn unknown_url_extension_without_override_is_unsupported() {
        let err = resolve_media("http://example.com/stream", None).unwrap_err();
        assert!(matches!(err, Error::UnsupportedFormat { .. }));
    }

    #[test]
    fn explicit_type_overrides_extension_table() {
        let source = resolve_media("http://example.com/stream", Some("video/mp4")).unwrap();
        assert_eq!(source.content_type(), "video/mp4");
    }

    #[test]
    fn missing_local_file_is_reported() {
        let err = resolve_media("/no/such/place/movie.mp4", None).unwrap_err();
        let Error::FileNotFound { path } = err else {
            panic!("expected FileNotFound, got {err:?}");
        };
        assert_eq!(path, PathBuf::from("/no/such/place/movie.mp4"));
    }

    #[test]
    fn local_file_gets_type_from_extension() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("Movie.MKV");
        std::fs::write(&path, b"x").unwrap();

        let source = resolve_media(path.to_str().unwrap(), None).unwrap();
        assert_eq!(source.content_type(), "video/x-matroska");
        assert_eq!(source.local_path(), Some(path.as_path()));
    }

    #[test]
    fn local_file_with_unknown_extension_is_unsupported() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("movie.xyz");
        std::fs::write(&path, b"x").unwrap();

        let err = resolve_media(path.to_str().unwrap(), None).unwrap_err();
        assert!(matches!(err, Error::UnsupportedFormat { .. }));
    }

    #[test]
    fn subtitle_extensions_resolve() {
        let source = resolve_subtitles("http://example.com/subs.vtt", None).unwrap();
        assert_eq!(source.content_type(), "text/vtt");

        // The media table does not apply to subtitles.
        let err = resolve_subtitles("http://example.com/subs.mp4", None).unwrap_err();
        assert!(matches!(err, Error::UnsupportedFormat { .. }));
    }

    #[test]
    fn loopback_device_address_is_unreachable() {
        let err = local_ip_for("127.0.0.1".parse().unwrap()).unwrap_err();
        assert!(matches!(err, Error::NetworkUnreachable(_)));
    }

    #[test]
    fn plan_with_subtitles_builds_text_track() {
        let plan = MediaPlan {
            content_url: "http://192.168.1.2:44301/video".to_string(),
            content_type: "video/mp4".to_string(),
            subtitles: Some(SubtitleRef {
                url: "http://192.168.1.2:44301/subtitles".to_string(),
                content_type: "text/vtt".to_string(),
            }),
        };

        let media = plan.to_media(Some("movie".to_string()));
        let tracks = media.tracks.unwrap();
        assert_eq!(tracks.len(), 1);
        assert_eq!(tracks[0].track_id, SUBTITLE_TRACK_ID);
        assert_eq!(tracks[0].track_content_id.as_deref(),
                   Some("http://192.168.1.2:44301/subtitles"));
        assert_eq!(plan.active_track_ids(), Some(vec![SUBTITLE_TRACK_ID]));
    }

    #[test]
    fn plan_without_subtitles_has_no_tracks() {
        let plan = MediaPlan {
            content_url: "http://example.com/a.mp4".to_string(),
            content_type: "video/mp4".to_string(),
            subtitles: None,
        };

        assert!(plan.to_media(None).tracks.is_none());
        assert!(plan.active_track_ids().is_none());
    }
}
