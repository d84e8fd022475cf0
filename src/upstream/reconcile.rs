//! Reconciling a reply head with the object it answers.
//!
//! Everything here is pure: the reply handler feeds in the stored
//! metadata and the parsed head and applies the outcome.

use std::time::{Duration, SystemTime};

use crate::http::{append_via, CacheFlags, Method, ResponseHead};
use crate::store::{ObjectFlags, ObjectMeta};

/// What the reply means for the object's identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Verdict {
    /// Same entity; merge into the existing object.
    Accept,
    /// Different entity; a new object takes over the key. `dynamic` is
    /// set when a `304`/`412` contradicted the stored validators.
    Supersede { dynamic: bool },
    /// `416` for an object we have never filled.
    RangeNotSatisfiable,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Judgement {
    pub(crate) verdict: Verdict,
    /// The origin answered a conditional request in full although the
    /// validators matched.
    pub(crate) lied: bool,
}

fn etags_differ(old: Option<&str>, new: Option<&str>) -> bool {
    matches!((old, new), (Some(a), Some(b)) if a != b)
}

fn times_differ(old: Option<SystemTime>, new: Option<SystemTime>) -> bool {
    matches!((old, new), (Some(a), Some(b)) if a != b)
}

/// Decide whether `head` describes the entity stored under `meta`.
pub(crate) fn judge(
    meta: &ObjectMeta,
    flags: ObjectFlags,
    head: &ResponseHead,
    full_len: Option<u64>,
    method: Method,
) -> Judgement {
    let initial = flags.contains(ObjectFlags::INITIAL);
    let etag = head.etag.as_deref();
    let old_etag = meta.etag.as_deref();
    let mut supersede = false;
    let mut dynamic = false;
    let mut lied = false;

    if head.code == 304 || head.code == 412 {
        if etags_differ(old_etag, etag) || times_differ(meta.last_modified, head.last_modified) {
            dynamic = true;
            supersede = true;
        }
    } else if !initial {
        if (meta.last_modified.is_none() || head.last_modified.is_none())
            && (old_etag.is_none() || etag.is_none())
        {
            supersede = true;
        } else if meta.last_modified != head.last_modified {
            supersede = true;
        } else if old_etag.is_some() || etag.is_some() {
            if etags_differ(old_etag, etag) || old_etag.is_none() {
                supersede = true;
            }
        }

        if !supersede {
            if let (Some(old), Some(new)) = (meta.length, full_len) {
                if old != new {
                    supersede = true;
                }
            }
        }

        let validated = (meta.last_modified.is_some() && head.last_modified.is_some())
            || (old_etag.is_some() && etag.is_some());
        if !supersede && validated && method == Method::ConditionalGet {
            lied = true;
        }
    } else if head.code == 416 {
        return Judgement {
            verdict: Verdict::RangeNotSatisfiable,
            lied: false,
        };
    }

    let verdict = if supersede && !initial {
        Verdict::Supersede { dynamic }
    } else {
        Verdict::Accept
    };
    Judgement { verdict, lied }
}

/// Heuristic: the entity changes often enough that revalidating it is
/// always worthwhile.
pub(crate) fn suspect_dynamic(
    old: &ObjectMeta,
    head: &ResponseHead,
    superseding: bool,
    cache_is_shared: bool,
) -> bool {
    let cc = &head.cache_control;
    let mut volatile = CacheFlags::NO_HIDDEN | CacheFlags::NO | CacheFlags::NO_STORE;
    if cache_is_shared {
        volatile |= CacheFlags::PRIVATE;
    }
    if head.etag.is_none() && head.last_modified.is_none() {
        return true;
    }
    if cc.flags.intersects(volatile) {
        return true;
    }
    if cc.max_age.map_or(false, |a| a <= 2) {
        return true;
    }
    if cache_is_shared && cc.s_maxage.map_or(false, |a| a <= 5) {
        return true;
    }
    if let (Some(lm), Some(exp)) = (old.last_modified, old.expires) {
        if exp.duration_since(lm).map_or(true, |d| d <= Duration::from_secs(1)) {
            return true;
        }
    }
    if superseding {
        if let (Some(old_date), Some(date)) = (old.date, head.date) {
            if old_date.duration_since(date).map_or(true, |d| d <= Duration::from_secs(5)) {
                return true;
            }
        }
    }
    false
}

/// Replies worth noting in the log as uncacheable.
pub(crate) fn is_uncacheable(
    meta: &ObjectMeta,
    head: &ResponseHead,
    cache_is_shared: bool,
) -> bool {
    if !matches!(head.code, 200 | 206 | 304 | 412) {
        return false;
    }
    let cc = &head.cache_control;
    cc.flags.intersects(CacheFlags::NO | CacheFlags::NO_STORE)
        || cc.max_age == Some(0)
        || (cache_is_shared && cc.s_maxage == Some(0))
        || matches!((head.expires, meta.age), (Some(e), Some(a)) if e <= a)
}

/// Status and message the object keeps after `code`.
pub(crate) fn apply_status(meta: &mut ObjectMeta, code: u16, reason: &str) {
    match code {
        200 | 300 | 301 | 302 | 303 | 307 | 401 | 403 | 404 | 405 => {
            meta.code = code;
            meta.message = reason.to_string();
        }
        206 | 304 | 412 => {
            if meta.code != 200 || meta.message.is_empty() {
                meta.code = 200;
                meta.message = "OK".to_string();
            }
        }
        _ => {
            meta.code = code;
            meta.message = reason.to_string();
        }
    }
}

/// Merge the reply's metadata into `meta`. Returns whether the object
/// must only be read linearly.
///
/// A partial reply to an object already holding data only fills fields
/// that are still missing.
pub(crate) fn merge_metadata(
    meta: &mut ObjectMeta,
    head: &ResponseHead,
    initial: bool,
    age: SystemTime,
    proxy_name: &str,
) -> bool {
    let cc = &head.cache_control;
    let overwrite = initial || head.code != 206;
    let mut linear = false;

    meta.age = Some(age);
    meta.cache_control |= cc.flags;
    // A partial reply only fills in what the stored entity lacks.
    if overwrite || meta.max_age.is_none() {
        meta.max_age = cc.max_age;
    }
    if overwrite || meta.s_maxage.is_none() {
        meta.s_maxage = cc.s_maxage;
    }

    for (slot, value) in [
        (&mut meta.date, head.date),
        (&mut meta.last_modified, head.last_modified),
        (&mut meta.expires, head.expires),
    ] {
        if value.is_some() && (overwrite || slot.is_none()) {
            *slot = value;
        }
    }
    if meta.etag.is_none() {
        meta.etag = head.etag.clone();
    }

    apply_status(meta, head.code, &head.reason);

    if cc.flags.contains(CacheFlags::AUTHORIZATION) && !cc.flags.contains(CacheFlags::PUBLIC) {
        meta.cache_control |= CacheFlags::NO_HIDDEN;
        linear = true;
    }

    match head.code {
        200 | 206 | 300 | 302 | 304 | 410 => {}
        301 | 303 | 307 | 403 | 404 | 405 | 416 => {
            if meta.expires.is_none() && !cc.flags.contains(CacheFlags::PUBLIC) {
                meta.cache_control |= CacheFlags::NO_HIDDEN;
            }
        }
        _ => {
            meta.cache_control |= CacheFlags::NO_HIDDEN;
            linear = true;
        }
    }

    if overwrite || meta.via.is_none() {
        meta.via = Some(append_via(head.via.as_deref(), head.version, proxy_name));
    }

    if meta.cache_control.contains(CacheFlags::NO_STORE)
        || (meta.cache_control.contains(CacheFlags::VARY) && meta.etag.is_none())
    {
        meta.cache_control |= CacheFlags::NO_HIDDEN;
    }
    linear
}

/// Whether the reply carries a body, given the request method.
pub(crate) fn expects_body(method: Method, head: &ResponseHead, chunked: bool) -> bool {
    if method == Method::Head || head.code < 200 || head.code == 204 || head.code == 304 {
        false
    } else if chunked {
        true
    } else {
        head.content_length != Some(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::parse_response_head;
    use std::time::UNIX_EPOCH;

    fn head(text: &str) -> ResponseHead {
        parse_response_head(text.as_bytes()).unwrap()
    }

    fn stored(etag: Option<&str>, lm: Option<u64>) -> ObjectMeta {
        ObjectMeta {
            code: 200,
            message: "OK".into(),
            etag: etag.map(str::to_string),
            last_modified: lm.map(|s| UNIX_EPOCH + Duration::from_secs(s)),
            ..ObjectMeta::default()
        }
    }

    #[test]
    fn fresh_object_is_always_accepted() {
        let h = head("HTTP/1.1 200 OK\r\nETag: \"b\"\r\nContent-Length: 3\r\n\r\n");
        let j = judge(&stored(Some("a"), None), ObjectFlags::INITIAL, &h, Some(3), Method::Get);
        assert_eq!(j.verdict, Verdict::Accept);
    }

    #[test]
    fn not_modified_with_matching_etag() {
        let h = head("HTTP/1.1 304 Not Modified\r\nETag: \"a\"\r\n\r\n");
        let j = judge(&stored(Some("a"), None), ObjectFlags::NONE, &h, None, Method::ConditionalGet);
        assert_eq!(j, Judgement { verdict: Verdict::Accept, lied: false });
    }

    #[test]
    fn not_modified_with_other_etag_supersedes() {
        let h = head("HTTP/1.1 304 Not Modified\r\nETag: \"b\"\r\n\r\n");
        let j = judge(&stored(Some("a"), None), ObjectFlags::NONE, &h, None, Method::ConditionalGet);
        assert_eq!(j.verdict, Verdict::Supersede { dynamic: true });
    }

    #[test]
    fn full_reply_with_other_etag_supersedes() {
        let h = head("HTTP/1.1 200 OK\r\nETag: \"b\"\r\nContent-Length: 3\r\n\r\n");
        let j = judge(&stored(Some("a"), None), ObjectFlags::NONE, &h, Some(3), Method::Get);
        assert_eq!(j.verdict, Verdict::Supersede { dynamic: false });
    }

    #[test]
    fn length_conflict_supersedes() {
        let mut meta = stored(Some("a"), None);
        meta.length = Some(10);
        let h = head("HTTP/1.1 200 OK\r\nETag: \"a\"\r\nContent-Length: 11\r\n\r\n");
        let j = judge(&meta, ObjectFlags::NONE, &h, Some(11), Method::Get);
        assert_eq!(j.verdict, Verdict::Supersede { dynamic: false });
    }

    #[test]
    fn ignored_conditional_counts_as_a_lie() {
        let h = head("HTTP/1.1 200 OK\r\nETag: \"a\"\r\nContent-Length: 3\r\n\r\n");
        let j = judge(&stored(Some("a"), None), ObjectFlags::NONE, &h, Some(3), Method::ConditionalGet);
        assert_eq!(j, Judgement { verdict: Verdict::Accept, lied: true });
    }

    #[test]
    fn range_not_satisfiable_on_initial() {
        let h = head("HTTP/1.1 416 Range Not Satisfiable\r\nContent-Length: 0\r\n\r\n");
        let j = judge(&ObjectMeta::default(), ObjectFlags::INITIAL, &h, Some(0), Method::Get);
        assert_eq!(j.verdict, Verdict::RangeNotSatisfiable);
    }

    #[test]
    fn dynamic_heuristics() {
        let old = ObjectMeta::default();
        let no_validators = head("HTTP/1.1 200 OK\r\n\r\n");
        assert!(suspect_dynamic(&old, &no_validators, false, true));

        let stable = head("HTTP/1.1 200 OK\r\nETag: \"a\"\r\nCache-Control: max-age=3600\r\n\r\n");
        assert!(!suspect_dynamic(&old, &stable, false, true));

        let short = head("HTTP/1.1 200 OK\r\nETag: \"a\"\r\nCache-Control: max-age=1\r\n\r\n");
        assert!(suspect_dynamic(&old, &short, false, true));

        let private = head("HTTP/1.1 200 OK\r\nETag: \"a\"\r\nCache-Control: private\r\n\r\n");
        assert!(suspect_dynamic(&old, &private, false, true));
        assert!(!suspect_dynamic(&old, &private, false, false));
    }

    #[test]
    fn status_normalisation() {
        let mut meta = stored(None, None);
        apply_status(&mut meta, 206, "Partial Content");
        assert_eq!((meta.code, meta.message.as_str()), (200, "OK"));
        apply_status(&mut meta, 404, "Not Found");
        assert_eq!((meta.code, meta.message.as_str()), (404, "Not Found"));
        apply_status(&mut meta, 304, "Not Modified");
        assert_eq!((meta.code, meta.message.as_str()), (200, "OK"));
    }

    #[test]
    fn unknown_codes_are_hidden_and_linear() {
        let mut meta = ObjectMeta::default();
        let h = head("HTTP/1.1 500 Oops\r\nContent-Length: 0\r\n\r\n");
        assert!(merge_metadata(&mut meta, &h, true, UNIX_EPOCH, "me"));
        assert!(meta.cache_control.contains(CacheFlags::NO_HIDDEN));
        assert_eq!(meta.code, 500);
    }

    #[test]
    fn vary_without_etag_is_hidden() {
        let mut meta = ObjectMeta::default();
        let h = head("HTTP/1.1 200 OK\r\nVary: Accept\r\nContent-Length: 0\r\n\r\n");
        assert!(!merge_metadata(&mut meta, &h, true, UNIX_EPOCH, "me"));
        assert!(meta.cache_control.contains(CacheFlags::NO_HIDDEN));
        assert_eq!(meta.via.as_deref(), Some("1.1 me"));
    }

    #[test]
    fn partial_reply_fills_only_missing_fields() {
        let lm = UNIX_EPOCH + Duration::from_secs(1000);
        let mut meta = stored(Some("a"), Some(1000));
        let h = head(
            "HTTP/1.1 206 Partial Content\r\nETag: \"a\"\r\n\
             Last-Modified: Thu, 01 Jan 1970 00:20:00 GMT\r\n\
             Date: Thu, 01 Jan 1970 01:00:00 GMT\r\n\
             Content-Range: bytes 0-1/10\r\nContent-Length: 2\r\n\r\n",
        );
        merge_metadata(&mut meta, &h, false, UNIX_EPOCH, "me");
        assert_eq!(meta.last_modified, Some(lm));
        assert_eq!(meta.date, Some(UNIX_EPOCH + Duration::from_secs(3600)));
    }

    #[test]
    fn partial_reply_keeps_freshness_and_via() {
        let mut meta = stored(Some("a"), Some(1000));
        meta.max_age = Some(600);
        meta.via = Some("1.1 me".to_string());
        let h = head(
            "HTTP/1.1 206 Partial Content\r\nETag: \"a\"\r\n\
             Cache-Control: max-age=5, s-maxage=7\r\nVia: 1.0 edge\r\n\
             Content-Range: bytes 0-1/10\r\nContent-Length: 2\r\n\r\n",
        );
        merge_metadata(&mut meta, &h, false, UNIX_EPOCH, "me");
        assert_eq!(meta.max_age, Some(600));
        assert_eq!(meta.via.as_deref(), Some("1.1 me"));
        // Missing fields are still taken from the reply.
        assert_eq!(meta.s_maxage, Some(7));

        let full = head(
            "HTTP/1.1 200 OK\r\nETag: \"a\"\r\nCache-Control: max-age=5\r\n\
             Via: 1.0 edge\r\nContent-Length: 10\r\n\r\n",
        );
        merge_metadata(&mut meta, &full, false, UNIX_EPOCH, "me");
        assert_eq!(meta.max_age, Some(5));
        assert_eq!(meta.s_maxage, None);
        assert_eq!(meta.via.as_deref(), Some("1.0 edge, 1.1 me"));
    }

    #[test]
    fn reconciling_identical_replies_is_idempotent() {
        let text = "HTTP/1.1 200 OK\r\nETag: \"a\"\r\n\
                    Last-Modified: Thu, 01 Jan 1970 00:16:40 GMT\r\n\
                    Cache-Control: max-age=60\r\nContent-Length: 4\r\n\r\n";
        let h = head(text);
        let mut meta = ObjectMeta::default();
        merge_metadata(&mut meta, &h, true, UNIX_EPOCH, "me");
        meta.length = Some(4);

        let again = head(text);
        let j = judge(&meta, ObjectFlags::NONE, &again, Some(4), Method::Get);
        assert_eq!(j, Judgement { verdict: Verdict::Accept, lied: false });
        let before = meta.clone();
        merge_metadata(&mut meta, &again, false, UNIX_EPOCH, "me");
        assert_eq!(meta, before);
    }
}
