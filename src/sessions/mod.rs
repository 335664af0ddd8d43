//! Tracking of live authentication sessions.
//!
//! A session is reachable in exactly one way at a time: parked in its slot
//! inside the manager, or owned by the single [`InUseAuthSession`] handle
//! that checked it out. The handle returns the session on drop, handing it
//! straight to the next queued waiter if one exists.
//!
//! All mutations run on one cooperative executor; the expiration "timer"
//! is whoever owns that executor calling [`AuthSessionManager::expire_auth_sessions`]
//! at [`AuthSessionManager::next_deadline`].

mod session;

use std::cell::RefCell;
use std::collections::{BTreeSet, HashMap, VecDeque};
use std::rc::{Rc, Weak};
use std::time::{Duration, SystemTime};

use anyhow::{bail, Error};
use log::error;

pub use session::{AuthIntent, AuthSession, AuthSessionToken, AuthState};

/// How long an authenticated session stays alive after its handle returns.
pub const AUTH_TIMEOUT: Duration = Duration::from_secs(5 * 60);

/// Time source, injectable for tests.
pub trait Clock {
    fn now(&self) -> SystemTime;
}

/// Wall clock.
#[derive(Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> SystemTime {
        SystemTime::now()
    }
}

/// Deadline of a session. `Never` orders after every finite deadline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum Expiry {
    At(SystemTime),
    Never,
}

type SessionCallback = Box<dyn FnOnce(InUseAuthSession)>;

/// A slot holds the session while nobody uses it. An occupied slot with an
/// empty `session` means "currently checked out".
#[derive(Default)]
struct SessionSlot {
    session: Option<Box<AuthSession>>,
    pending: VecDeque<SessionCallback>,
}

struct Inner {
    sessions: HashMap<AuthSessionToken, SessionSlot>,
    // One entry per slot; kept sorted so the earliest deadline is first.
    expiration_index: BTreeSet<(Expiry, AuthSessionToken)>,
    clock: Rc<dyn Clock>,
}

impl Inner {
    fn expiry_of(&self, token: AuthSessionToken) -> Option<Expiry> {
        self.expiration_index
            .iter()
            .find(|(_, t)| *t == token)
            .map(|(expiry, _)| *expiry)
    }

    fn reschedule(&mut self, token: AuthSessionToken, new_expiry: Expiry) {
        self.expiration_index.retain(|(_, t)| *t != token);
        self.expiration_index.insert((new_expiry, token));
    }

    fn session_on_auth(&mut self, token: AuthSessionToken) {
        if self.expiry_of(token).is_none() {
            error!("OnAuth fired for a session that is not managed");
            return;
        }
        let deadline = self.clock.now() + AUTH_TIMEOUT;
        self.reschedule(token, Expiry::At(deadline));
    }

    /// Parks the session back, or hands it to the next waiter. The caller
    /// invokes the returned callback after releasing the borrow.
    fn mark_not_in_use(
        &mut self,
        session: Box<AuthSession>,
    ) -> Option<(SessionCallback, Box<AuthSession>)> {
        // A slot that has been removed while the session was out means the
        // session dies now.
        let Some(slot) = self.sessions.get_mut(&session.token()) else {
            return None;
        };
        if let Some(callback) = slot.pending.pop_front() {
            return Some((callback, session));
        }
        slot.session = Some(session);
        None
    }
}

pub struct AuthSessionManager {
    inner: Rc<RefCell<Inner>>,
}

impl AuthSessionManager {
    pub fn new(clock: Rc<dyn Clock>) -> Self {
        Self {
            inner: Rc::new(RefCell::new(Inner {
                sessions: HashMap::new(),
                expiration_index: BTreeSet::new(),
                clock,
            })),
        }
    }

    /// Creates a session and returns the only handle to it. The slot is
    /// inserted in checked-out state, so nothing can race the caller.
    pub fn create_auth_session(
        &self,
        account: storage_api::users::Username,
        intent: AuthIntent,
    ) -> InUseAuthSession {
        let session = Box::new(AuthSession::new(account, intent));
        let token = session.token();

        let mut inner = self.inner.borrow_mut();
        // Token collision would silently merge two users' sessions.
        assert!(
            !inner.sessions.contains_key(&token),
            "AuthSession token collision"
        );
        inner.sessions.insert(token, SessionSlot::default());
        // Sessions do not expire before authentication.
        inner.expiration_index.insert((Expiry::Never, token));
        drop(inner);

        InUseAuthSession::active(Rc::downgrade(&self.inner), session)
    }

    /// Checks the session out. Returns a null handle tagged "not found" or
    /// "busy" when the session is absent or already checked out.
    pub fn find_auth_session(&self, token: AuthSessionToken) -> InUseAuthSession {
        let mut inner = self.inner.borrow_mut();
        let Some(slot) = inner.sessions.get_mut(&token) else {
            return InUseAuthSession::missing(SessionStatus::NotFound);
        };
        match slot.session.take() {
            None => InUseAuthSession::missing(SessionStatus::Busy),
            Some(session) => {
                drop(inner);
                InUseAuthSession::active(Rc::downgrade(&self.inner), session)
            }
        }
    }

    /// Runs `callback` with a checked-out handle as soon as the session is
    /// available: synchronously if it is free, otherwise queued for the
    /// moment the current holder lets go.
    pub fn run_when_available(&self, token: AuthSessionToken, callback: SessionCallback) {
        let handle = {
            let mut inner = self.inner.borrow_mut();
            let Some(slot) = inner.sessions.get_mut(&token) else {
                drop(inner);
                callback(InUseAuthSession::missing(SessionStatus::NotFound));
                return;
            };
            match slot.session.take() {
                None => {
                    slot.pending.push_back(callback);
                    return;
                }
                Some(session) => InUseAuthSession::active(Rc::downgrade(&self.inner), session),
            }
        };
        callback(handle);
    }

    /// Removes a session. A checked-out session is destroyed when its
    /// holder returns it; queued waiters get a "not found" handle.
    pub fn remove_auth_session(&self, token: AuthSessionToken) -> bool {
        let (removed, pending) = {
            let mut inner = self.inner.borrow_mut();
            inner.expiration_index.retain(|(_, t)| *t != token);
            match inner.sessions.remove(&token) {
                None => (false, VecDeque::new()),
                Some(slot) => (true, slot.pending),
            }
        };
        for callback in pending {
            callback(InUseAuthSession::missing(SessionStatus::NotFound));
        }
        removed
    }

    pub fn remove_all_auth_sessions(&self) {
        let slots: Vec<AuthSessionToken> = {
            let inner = self.inner.borrow();
            inner.sessions.keys().copied().collect()
        };
        for token in slots {
            self.remove_auth_session(token);
        }
    }

    /// Earliest finite deadline, i.e. when the expiration driver should
    /// fire next. `None` means nothing can expire yet.
    pub fn next_deadline(&self) -> Option<SystemTime> {
        let inner = self.inner.borrow();
        match inner.expiration_index.iter().next() {
            Some((Expiry::At(time), _)) => Some(*time),
            _ => None,
        }
    }

    /// Removes every session whose deadline has passed, in non-decreasing
    /// deadline order. The earliest finite entry is removed even when the
    /// driver fired marginally early, so a slightly-fast timer cannot turn
    /// into a busy-wait.
    pub fn expire_auth_sessions(&self) {
        let mut all_pending = Vec::new();
        {
            let mut inner = self.inner.borrow_mut();
            let now = inner.clock.now();

            let mut expired = Vec::new();
            let mut first_entry = true;
            for (expiry, token) in inner.expiration_index.iter() {
                match expiry {
                    Expiry::Never => break,
                    Expiry::At(time) if first_entry || *time <= now => {
                        expired.push((*expiry, *token));
                    }
                    Expiry::At(_) => break,
                }
                first_entry = false;
            }

            for (expiry, token) in expired {
                inner.expiration_index.remove(&(expiry, token));
                match inner.sessions.remove(&token) {
                    Some(slot) => all_pending.extend(slot.pending),
                    None => panic!("expired a session that is not managed"),
                }
            }
        }
        for callback in all_pending {
            callback(InUseAuthSession::missing(SessionStatus::NotFound));
        }
    }

    pub fn session_count(&self) -> usize {
        self.inner.borrow().sessions.len()
    }
}

/// Why a handle carries no session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    /// The handle owns the session.
    Active,
    /// No session with that token exists.
    NotFound,
    /// The session is checked out by another operation.
    Busy,
}

/// Owning handle on a checked-out session. While it is alive, every other
/// `find_auth_session` on the same token reports "busy". Dropping it parks
/// the session back in its slot or forwards it to the next queued waiter.
pub struct InUseAuthSession {
    inner: Weak<RefCell<Inner>>,
    status: SessionStatus,
    session: Option<Box<AuthSession>>,
}

impl InUseAuthSession {
    fn active(inner: Weak<RefCell<Inner>>, session: Box<AuthSession>) -> Self {
        Self {
            inner,
            status: SessionStatus::Active,
            session: Some(session),
        }
    }

    fn missing(status: SessionStatus) -> Self {
        Self {
            inner: Weak::new(),
            status,
            session: None,
        }
    }

    pub fn status(&self) -> SessionStatus {
        self.status
    }

    pub fn session(&self) -> Option<&AuthSession> {
        self.session.as_deref()
    }

    /// Marks the session authenticated and starts its expiration clock.
    pub fn authenticate(&mut self) -> Result<(), Error> {
        let Some(session) = self.session.as_mut() else {
            bail!("Cannot authenticate a null session handle");
        };
        session.set_authenticated();
        let token = session.token();
        if let Some(inner) = self.inner.upgrade() {
            inner.borrow_mut().session_on_auth(token);
        }
        Ok(())
    }

    /// Remaining lifetime: `Duration::MAX` before the first
    /// authentication, zero once the session is marked for destruction.
    pub fn get_remaining_time(&self) -> Duration {
        let Some(session) = self.session.as_deref() else {
            return Duration::ZERO;
        };
        let Some(inner) = self.inner.upgrade() else {
            return Duration::ZERO;
        };
        let inner = inner.borrow();
        match inner.expiry_of(session.token()) {
            None => Duration::ZERO,
            Some(Expiry::Never) => Duration::MAX,
            Some(Expiry::At(time)) => time
                .duration_since(inner.clock.now())
                .unwrap_or(Duration::ZERO),
        }
    }

    /// Pushes the session's finite deadline out by `extension`. Fails when
    /// no finite deadline exists: either the session is already marked for
    /// destruction, or it has never been authenticated.
    pub fn extend_timeout(&self, extension: Duration) -> Result<(), Error> {
        let Some(session) = self.session.as_deref() else {
            bail!("Cannot extend a null session handle");
        };
        let Some(inner) = self.inner.upgrade() else {
            bail!("Session manager is gone");
        };
        let mut inner = inner.borrow_mut();
        let token = session.token();
        match inner.expiry_of(token) {
            Some(Expiry::At(time)) => {
                inner.reschedule(token, Expiry::At(time + extension));
                Ok(())
            }
            Some(Expiry::Never) | None => {
                bail!("Session has no finite deadline to extend")
            }
        }
    }
}

impl Drop for InUseAuthSession {
    fn drop(&mut self) {
        let Some(session) = self.session.take() else {
            return;
        };
        let Some(inner_rc) = self.inner.upgrade() else {
            return;
        };
        // All slot accesses finish before any callback handle is built, so
        // re-entry from the callback sees a consistent manager.
        let action = inner_rc.borrow_mut().mark_not_in_use(session);
        if let Some((callback, session)) = action {
            callback(InUseAuthSession::active(
                Rc::downgrade(&inner_rc),
                session,
            ));
        }
    }
}
