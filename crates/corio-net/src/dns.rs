//! Async name resolution with the legacy calling conventions.
//!
//! Four entry points layered on one reactor primitive:
//!
//! - [`getaddrinfo_async`] — the full lookup; everything else wraps it or
//!   its name-info sibling.
//! - [`gethostbyname_async`] — IPv4 convenience wrapper with the classic
//!   hostent shape. The returned buffer is anchored in the calling
//!   coroutine's internal context and released when the coroutine ends; a
//!   repeat call replaces the previous buffer.
//! - [`gethostbyaddr_async`] — reverse lookup for IPv4 literals.
//! - [`getaddresses_async`] — UNSPEC-family lookup that flattens the
//!   result chain into socket addresses.

use crate::errno::{self, fail_errno};
use corio_core::addr::{AddrInfoHints, AddrInfoList};
use corio_core::co_warn;
use corio_core::coroutine::{
    context_key_alloc, resume, resume_with_error, ContextKey, CoroutineRef,
};
use corio_core::event::{EventCallback, EventRef};
use corio_core::failure::Failure;
use corio_core::reactor;
use corio_core::tls;
use corio_core::waker::{resume_when, waker_destroy, waker_new};
use std::cell::RefCell;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::rc::Rc;
use std::sync::OnceLock;

/// The classic `struct hostent` shape, ownership-safe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Hostent {
    /// Canonical host name (falls back to the queried name).
    pub name: String,
    /// Always empty; kept for shape compatibility.
    pub aliases: Vec<String>,
    /// Always `AF_INET`.
    pub addrtype: i32,
    /// Address length in bytes (4 for IPv4).
    pub length: usize,
    pub addr_list: Vec<Ipv4Addr>,
}

static HOSTENT_KEY: OnceLock<ContextKey> = OnceLock::new();

fn hostent_key() -> ContextKey {
    *HOSTENT_KEY.get_or_init(|| context_key_alloc("corio_net_hostent"))
}

struct AddrInfoCallback {
    coroutine: CoroutineRef,
    result: Rc<RefCell<Option<AddrInfoList>>>,
}

impl EventCallback for AddrInfoCallback {
    fn invoke(&self, event: &EventRef, failure: Option<&Failure>) {
        if let Some(failure) = failure {
            event.mark_failure_handled();
            resume_with_error(&self.coroutine, failure.clone());
            return;
        }

        if self.coroutine.has_waker() {
            *self.result.borrow_mut() = event.addr_result();
            self.coroutine.with_waker(|w| w.set_flag(true));
        }
        resume(&self.coroutine);
    }
}

struct NameInfoCallback {
    coroutine: CoroutineRef,
    hostname: Rc<RefCell<Option<Rc<str>>>>,
}

impl EventCallback for NameInfoCallback {
    fn invoke(&self, event: &EventRef, failure: Option<&Failure>) {
        if let Some(failure) = failure {
            event.mark_failure_handled();
            resume_with_error(&self.coroutine, failure.clone());
            return;
        }

        if self.coroutine.has_waker() {
            *self.hostname.borrow_mut() = event.hostname();
            self.coroutine.with_waker(|w| w.set_flag(true));
        }
        resume(&self.coroutine);
    }
}

/// Resolve `node`/`service` into an address chain.
///
/// Requires coroutine context and at least one of `node`/`service`;
/// violating either fails with `EINVAL`. On success returns `0` and
/// stores the chain in `res`; on failure returns `-1` with `errno` set
/// per the cooperative-failure mapping.
pub fn getaddrinfo_async(
    node: Option<&str>,
    service: Option<&str>,
    hints: &AddrInfoHints,
    res: &mut Option<AddrInfoList>,
) -> i32 {
    let Some(coroutine) = tls::current_coroutine() else {
        return fail_errno(libc::EINVAL);
    };
    if node.is_none() && service.is_none() {
        return fail_errno(libc::EINVAL);
    }
    let Some(reactor) = tls::reactor() else {
        return fail_errno(libc::EINVAL);
    };

    if let Err(failure) = waker_new(&coroutine) {
        coroutine.set_failure(failure);
        errno::consume_failure(&coroutine);
        waker_destroy(&coroutine);
        return -1;
    }

    let event = match reactor.new_getaddrinfo_event(node, service, hints) {
        Ok(event) => event,
        Err(_) => {
            waker_destroy(&coroutine);
            return fail_errno(libc::ENOMEM);
        }
    };

    let result = Rc::new(RefCell::new(None));
    let record = Rc::new(AddrInfoCallback {
        coroutine: coroutine.clone(),
        result: result.clone(),
    });
    if let Err(failure) = resume_when(&coroutine, event, true, record) {
        coroutine.set_failure(failure);
        errno::consume_failure(&coroutine);
        waker_destroy(&coroutine);
        return -1;
    }

    coroutine.with_waker(|w| w.set_flag(false));
    reactor::suspend();

    if coroutine.has_failure() {
        errno::consume_failure(&coroutine);
        waker_destroy(&coroutine);
        return -1;
    }

    if coroutine.with_waker(|w| w.flag()) == Some(true) {
        *res = result.borrow_mut().take();
        waker_destroy(&coroutine);
        return 0;
    }

    errno::consume_failure(&coroutine);
    waker_destroy(&coroutine);
    -1
}

/// IPv4 `gethostbyname` wrapper.
///
/// Resolves with `AF_INET`/`SOCK_STREAM` hints and shapes the first entry
/// into a [`Hostent`]. The canonical strong reference lives in the
/// coroutine's internal context: a second call on the same coroutine
/// replaces (and thereby releases) the previous buffer, and a
/// coroutine-end hook registered on first use releases the last one.
/// Returns `None` on any failure.
pub fn gethostbyname_async(name: &str) -> Option<Rc<Hostent>> {
    if name.is_empty() {
        return None;
    }
    let coroutine = tls::current_coroutine()?;

    let hints = AddrInfoHints::inet_stream();
    let mut res = None;
    if getaddrinfo_async(Some(name), None, &hints, &mut res) != 0 {
        return None;
    }

    let list = res?;
    let first = list.first()?;
    if first.family != libc::AF_INET {
        return None;
    }
    let SocketAddr::V4(v4) = first.addr else {
        return None;
    };

    // The buffer must outlive this call but not the coroutine, so it is
    // anchored in the coroutine's context under a module singleton key.
    let key = hostent_key();
    let had_previous = coroutine.context_unset(key);

    let hostent = Rc::new(Hostent {
        name: first
            .canonname
            .clone()
            .unwrap_or_else(|| name.to_string()),
        aliases: Vec::new(),
        addrtype: libc::AF_INET,
        length: std::mem::size_of::<libc::in_addr>(),
        addr_list: vec![*v4.ip()],
    });

    coroutine.context_set(key, Box::new(hostent.clone()));

    // The release hook is registered once per coroutine; replacements
    // reuse it.
    if !had_previous {
        coroutine.add_finalizer(Box::new(move |co| {
            co.context_unset(key);
        }));
    }

    Some(hostent)
}

/// IPv4 reverse lookup.
///
/// `ip` must be an IPv4 literal. Returns the refcounted host name, or
/// `None` on any failure — failures are swallowed, never left pending on
/// the coroutine.
pub fn gethostbyaddr_async(ip: &str) -> Option<Rc<str>> {
    let coroutine = tls::current_coroutine()?;
    let parsed: Ipv4Addr = ip.parse().ok()?;
    let reactor = tls::reactor()?;

    if waker_new(&coroutine).is_err() {
        return None;
    }

    let event = match reactor.new_getnameinfo_event(SocketAddr::new(IpAddr::V4(parsed), 0)) {
        Ok(event) => event,
        Err(_) => {
            waker_destroy(&coroutine);
            return None;
        }
    };

    let hostname = Rc::new(RefCell::new(None));
    let record = Rc::new(NameInfoCallback {
        coroutine: coroutine.clone(),
        hostname: hostname.clone(),
    });
    if resume_when(&coroutine, event, true, record).is_err() {
        coroutine.take_failure();
        waker_destroy(&coroutine);
        return None;
    }

    coroutine.with_waker(|w| w.set_flag(false));
    reactor::suspend();

    if coroutine.has_failure() {
        coroutine.take_failure();
        waker_destroy(&coroutine);
        return None;
    }

    let resolved = coroutine.with_waker(|w| w.flag()) == Some(true);
    let name = hostname.borrow_mut().take();
    waker_destroy(&coroutine);

    if resolved {
        name
    } else {
        None
    }
}

fn report_dns_error(slot: &mut Option<&mut Option<String>>, message: String) {
    match slot {
        Some(out) => {
            // Replaces (and thereby frees) any message from a previous
            // iteration.
            **out = Some(message);
        }
        None => co_warn!("{}", message),
    }
}

/// Resolve `host` into a flat list of socket addresses (UNSPEC family).
///
/// Fills `sal` and returns the address count, or `-1` on failure with a
/// specific message in `error_string` (or a logged warning when the
/// caller passed `None`). An empty `host` resolves to nothing and
/// returns `0`.
pub fn getaddresses_async(
    host: &str,
    socktype: i32,
    sal: &mut Vec<SocketAddr>,
    mut error_string: Option<&mut Option<String>>,
) -> i32 {
    if host.is_empty() {
        return 0;
    }

    let hints = AddrInfoHints {
        socktype,
        ..AddrInfoHints::default()
    };
    let mut res = None;
    if getaddrinfo_async(Some(host), None, &hints, &mut res) != 0 {
        report_dns_error(
            &mut error_string,
            format!("getaddrinfo for {} failed", host),
        );
        return -1;
    }

    let list = match res {
        Some(list) if !list.is_empty() => list,
        _ => {
            report_dns_error(
                &mut error_string,
                format!("no addresses found for {}", host),
            );
            return -1;
        }
    };

    sal.clear();
    sal.extend(list.iter().map(|entry| entry.addr));
    sal.len() as i32
}

#[cfg(test)]
mod tests {
    use super::*;
    use corio_core::lab::LabReactor;
    use corio_core::log::{set_log_level, LogLevel};

    fn lab() -> Rc<LabReactor> {
        let lab = LabReactor::new();
        lab.install();
        lab
    }

    fn v4(s: &str) -> IpAddr {
        IpAddr::V4(s.parse().unwrap())
    }

    #[test]
    fn getaddrinfo_resolves_localhost() {
        let lab = lab();
        lab.add_dns_host("localhost", vec![v4("127.0.0.1")], None);

        let hints = AddrInfoHints::inet_stream();
        let mut res = None;
        let ret = lab.enter(|| getaddrinfo_async(Some("localhost"), None, &hints, &mut res));

        assert_eq!(ret, 0);
        let list = res.unwrap();
        assert_eq!(list.len(), 1);
        let first = list.first().unwrap();
        assert_eq!(first.family, libc::AF_INET);
        assert_eq!(first.addr.ip(), v4("127.0.0.1"));
        assert_eq!(lab.live_events(), 0);
    }

    #[test]
    fn getaddrinfo_requires_node_or_service() {
        let lab = lab();
        let mut res = None;
        let ret =
            lab.enter(|| getaddrinfo_async(None, None, &AddrInfoHints::default(), &mut res));
        assert_eq!(ret, -1);
        assert_eq!(errno::last_errno(), libc::EINVAL);
    }

    #[test]
    fn getaddrinfo_outside_coroutine_is_einval() {
        let mut res = None;
        let ret = getaddrinfo_async(Some("x"), None, &AddrInfoHints::default(), &mut res);
        assert_eq!(ret, -1);
        assert_eq!(errno::last_errno(), libc::EINVAL);
    }

    #[test]
    fn getaddrinfo_failure_leaves_no_waker() {
        set_log_level(LogLevel::Off);
        let lab = lab();
        let mut res = None;

        let ret = lab.clone().enter_with(|co| {
            let ret = getaddrinfo_async(
                Some("nope.invalid"),
                None,
                &AddrInfoHints::default(),
                &mut res,
            );
            assert!(!co.has_waker());
            assert!(!co.has_failure());
            ret
        });

        assert_eq!(ret, -1);
        assert_eq!(errno::last_errno(), libc::EINTR);
        assert!(res.is_none());
    }

    #[test]
    fn gethostbyname_builds_a_hostent() {
        let lab = lab();
        lab.add_dns_host("web.test", vec![v4("192.0.2.10")], Some("canon.web.test"));

        let hostent = lab
            .enter(|| gethostbyname_async("web.test"))
            .expect("resolution should succeed");

        assert_eq!(hostent.name, "canon.web.test");
        assert_eq!(hostent.addrtype, libc::AF_INET);
        assert_eq!(hostent.length, 4);
        assert!(hostent.aliases.is_empty());
        assert_eq!(hostent.addr_list, vec!["192.0.2.10".parse::<Ipv4Addr>().unwrap()]);
    }

    #[test]
    fn gethostbyname_falls_back_to_the_queried_name() {
        let lab = lab();
        lab.add_dns_host("plain.test", vec![v4("192.0.2.11")], None);

        let hostent = lab.enter(|| gethostbyname_async("plain.test")).unwrap();
        assert_eq!(hostent.name, "plain.test");
    }

    #[test]
    fn gethostbyname_unknown_host_is_none() {
        set_log_level(LogLevel::Off);
        let lab = lab();
        // Coroutine termination after a failed lookup must be clean.
        let out = lab.enter(|| gethostbyname_async("not.a.real.host.invalid"));
        assert!(out.is_none());
    }

    #[test]
    fn repeat_gethostbyname_replaces_the_buffer() {
        let lab = lab();
        lab.add_dns_host("a.test", vec![v4("192.0.2.1")], None);
        lab.add_dns_host("b.test", vec![v4("192.0.2.2")], None);

        let (first, second) = lab.enter(|| {
            let first = gethostbyname_async("a.test").unwrap();
            let second = gethostbyname_async("b.test").unwrap();
            // While the coroutine lives, the context holds the second
            // buffer: two strong refs to it, one to the first.
            assert_eq!(Rc::strong_count(&second), 2);
            assert_eq!(Rc::strong_count(&first), 1);
            (first, second)
        });

        assert!(!Rc::ptr_eq(&first, &second));
        // The coroutine ended; the context anchor is gone exactly once.
        assert_eq!(Rc::strong_count(&first), 1);
        assert_eq!(Rc::strong_count(&second), 1);
    }

    #[test]
    fn gethostbyaddr_resolves_known_addresses() {
        let lab = lab();
        lab.add_dns_name("192.0.2.7", "db.test");

        let name = lab.enter(|| gethostbyaddr_async("192.0.2.7"));
        assert_eq!(name.as_deref(), Some("db.test"));
    }

    #[test]
    fn gethostbyaddr_rejects_non_ipv4_input() {
        let lab = lab();
        assert!(lab.enter(|| gethostbyaddr_async("not-an-ip")).is_none());
        assert!(lab.enter(|| gethostbyaddr_async("::1")).is_none());
        // No event was ever created for rejected input.
        assert_eq!(lab.live_events(), 0);
    }

    #[test]
    fn gethostbyaddr_swallows_lookup_failures() {
        let lab = lab();
        let out = lab.clone().enter_with(|co| {
            let out = gethostbyaddr_async("192.0.2.250");
            assert!(!co.has_failure());
            assert!(!co.has_waker());
            out
        });
        assert!(out.is_none());
    }

    #[test]
    fn getaddresses_counts_and_copies() {
        let lab = lab();
        lab.add_dns_host(
            "multi.test",
            vec![v4("192.0.2.20"), v4("192.0.2.21")],
            None,
        );

        let mut sal = Vec::new();
        let mut err = None;
        let ret = lab.enter(|| {
            getaddresses_async("multi.test", libc::SOCK_STREAM, &mut sal, Some(&mut err))
        });

        assert_eq!(ret, 2);
        assert_eq!(sal.len(), 2);
        assert_eq!(sal[0].ip(), v4("192.0.2.20"));
        assert!(err.is_none());
    }

    #[test]
    fn getaddresses_reports_failure_in_error_string() {
        set_log_level(LogLevel::Off);
        let lab = lab();

        let mut sal = Vec::new();
        let mut err = Some(String::from("stale message"));
        let ret = lab.enter(|| {
            getaddresses_async("gone.invalid", libc::SOCK_STREAM, &mut sal, Some(&mut err))
        });

        assert_eq!(ret, -1);
        assert_eq!(err.as_deref(), Some("getaddrinfo for gone.invalid failed"));
        assert!(sal.is_empty());
    }

    #[test]
    fn getaddresses_warns_without_error_slot() {
        set_log_level(LogLevel::Off);
        let lab = lab();
        let mut sal = Vec::new();
        let ret =
            lab.enter(|| getaddresses_async("gone.invalid", libc::SOCK_STREAM, &mut sal, None));
        assert_eq!(ret, -1);
    }

    #[test]
    fn getaddresses_empty_host_is_zero() {
        let lab = lab();
        let mut sal = Vec::new();
        let ret = lab.enter(|| getaddresses_async("", libc::SOCK_STREAM, &mut sal, None));
        assert_eq!(ret, 0);
    }
}
