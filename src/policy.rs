//! retry policies applied around every unary call of a `Caller`
//!
//! Each policy sees the call and the next stage of the chain. The chain is built once, when the
//! caller is constructed, outermost policy first; the innermost stage sends the call on the
//! current channel.
//!
//! Every channel a caller installs gets a new generation number. A failed attempt reports the
//! generation it ran on, so a reconnect can tell whether that channel was already replaced by a
//! concurrent call.
use crate::errors::TransportError;
use crate::procedure::ProcedureCall;

/// A failed attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Failure {
    /// generation of the channel the attempt ran on
    pub generation: u64,
    /// what went wrong
    pub error: TransportError,
}

/// one stage of the call chain, as seen by a policy
pub trait Invoke {
    /// run the call through the rest of the chain
    fn invoke(&self, call: &ProcedureCall) -> Result<Vec<u8>, Failure>;

    /// Replace the channel of generation `stale` with a new one.
    ///
    /// Does nothing if that channel was already replaced.
    fn reconnect(&self, stale: u64) -> Result<(), Failure>;
}

/// A retry strategy.
///
/// `attempt` either returns the reply or the transport failure that ends the call.
pub trait RetryPolicy: Send + Sync {
    /// run `call` through `next`, retrying as this policy sees fit
    fn attempt(&self, call: &ProcedureCall, next: &dyn Invoke) -> Result<Vec<u8>, Failure>;
}

/// Absorb one transient failure: reconnect once, retry once.
///
/// Channels may go stale silently after a long idle time, this brings them back without
/// looping forever on a dead peer.
#[derive(Debug, Default, Clone, Copy)]
pub struct ReconnectOnce;

impl RetryPolicy for ReconnectOnce {
    fn attempt(&self, call: &ProcedureCall, next: &dyn Invoke) -> Result<Vec<u8>, Failure> {
        match next.invoke(call) {
            Err(f) if f.error.is_transient() => {
                warn!(
                    "transient failure on {:?}, reconnecting: {}",
                    call.name,
                    f.error.message()
                );
                next.reconnect(f.generation)?;
                next.invoke(call)
            }
            ret => ret,
        }
    }
}

/// Pass every failure straight through.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoRetry;

impl RetryPolicy for NoRetry {
    fn attempt(&self, call: &ProcedureCall, next: &dyn Invoke) -> Result<Vec<u8>, Failure> {
        next.invoke(call)
    }
}

/// run `call` through `policies` (outermost first) down to `base`
pub fn run_chain(
    policies: &[Box<dyn RetryPolicy>],
    base: &dyn Invoke,
    call: &ProcedureCall,
) -> Result<Vec<u8>, Failure> {
    match policies.split_first() {
        None => base.invoke(call),
        Some((outer, rest)) => {
            let inner = Chain { policies: rest, base };
            outer.attempt(call, &inner)
        }
    }
}

struct Chain<'a> {
    policies: &'a [Box<dyn RetryPolicy>],
    base: &'a dyn Invoke,
}

impl Invoke for Chain<'_> {
    fn invoke(&self, call: &ProcedureCall) -> Result<Vec<u8>, Failure> {
        run_chain(self.policies, self.base, call)
    }

    fn reconnect(&self, stale: u64) -> Result<(), Failure> {
        self.base.reconnect(stale)
    }
}

/// the chain used when a caller is built without explicit policies
pub fn default_policies() -> Vec<Box<dyn RetryPolicy>> {
    vec![Box::new(ReconnectOnce)]
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::collections::VecDeque;

    /// replays scripted results and counts reconnects
    struct Script {
        results: RefCell<VecDeque<Result<Vec<u8>, TransportError>>>,
        invokes: RefCell<usize>,
        reconnects: RefCell<Vec<u64>>,
        generation: RefCell<u64>,
        reconnect_fails: bool,
    }

    impl Script {
        fn new(results: Vec<Result<Vec<u8>, TransportError>>) -> Self {
            Script {
                results: RefCell::new(results.into()),
                invokes: RefCell::new(0),
                reconnects: RefCell::new(Vec::new()),
                generation: RefCell::new(1),
                reconnect_fails: false,
            }
        }
    }

    impl Invoke for Script {
        fn invoke(&self, _call: &ProcedureCall) -> Result<Vec<u8>, Failure> {
            *self.invokes.borrow_mut() += 1;
            let generation = *self.generation.borrow();
            self.results
                .borrow_mut()
                .pop_front()
                .expect("script exhausted")
                .map_err(|error| Failure { generation, error })
        }

        fn reconnect(&self, stale: u64) -> Result<(), Failure> {
            self.reconnects.borrow_mut().push(stale);
            if self.reconnect_fails {
                return Err(Failure {
                    generation: stale,
                    error: TransportError::transient("no route"),
                });
            }
            *self.generation.borrow_mut() += 1;
            Ok(())
        }
    }

    fn call() -> ProcedureCall {
        ProcedureCall::new("echo", b"hello".to_vec())
    }

    #[test]
    fn one_transient_failure_is_absorbed() {
        let script = Script::new(vec![
            Err(TransportError::transient("stale")),
            Ok(b"hello".to_vec()),
        ]);
        let ret = run_chain(&default_policies(), &script, &call());
        assert_eq!(ret.unwrap(), b"hello");
        assert_eq!(*script.invokes.borrow(), 2);
        // the reconnect names the channel that failed
        assert_eq!(*script.reconnects.borrow(), [1]);
    }

    #[test]
    fn second_failure_escalates() {
        let script = Script::new(vec![
            Err(TransportError::transient("stale")),
            Err(TransportError::transient("still down")),
        ]);
        let err = run_chain(&default_policies(), &script, &call()).unwrap_err();
        assert_eq!(err.error.message(), "still down");
        assert_eq!(err.generation, 2);
        assert_eq!(*script.invokes.borrow(), 2);
        assert_eq!(script.reconnects.borrow().len(), 1);
    }

    #[test]
    fn failed_reconnect_escalates() {
        let mut script = Script::new(vec![Err(TransportError::transient("stale"))]);
        script.reconnect_fails = true;
        let err = run_chain(&default_policies(), &script, &call()).unwrap_err();
        assert_eq!(err.error.message(), "no route");
        assert_eq!(*script.invokes.borrow(), 1);
    }

    #[test]
    fn remote_failures_are_not_retried() {
        let script = Script::new(vec![Err(TransportError::remote("bad procedure"))]);
        let err = run_chain(&default_policies(), &script, &call()).unwrap_err();
        assert!(!err.error.is_transient());
        assert_eq!(script.reconnects.borrow().len(), 0);
    }

    #[test]
    fn timeouts_are_not_retried() {
        let script = Script::new(vec![Err(TransportError::timeout("no reply"))]);
        let err = run_chain(&default_policies(), &script, &call()).unwrap_err();
        assert_eq!(err.error.kind(), crate::errors::TransportErrorKind::Timeout);
        assert_eq!(*script.invokes.borrow(), 1);
        assert!(script.reconnects.borrow().is_empty());
    }

    #[test]
    fn policies_compose_outermost_first() {
        // two stacked ReconnectOnce absorb two failures in total
        let policies: Vec<Box<dyn RetryPolicy>> =
            vec![Box::new(ReconnectOnce), Box::new(ReconnectOnce)];
        let script = Script::new(vec![
            Err(TransportError::transient("1")),
            Err(TransportError::transient("2")),
            Ok(b"ok".to_vec()),
        ]);
        assert_eq!(run_chain(&policies, &script, &call()).unwrap(), b"ok");
        assert_eq!(script.reconnects.borrow().len(), 2);

        let script = Script::new(vec![Err(TransportError::transient("1"))]);
        let policies: Vec<Box<dyn RetryPolicy>> = vec![Box::new(NoRetry)];
        assert!(run_chain(&policies, &script, &call()).is_err());
        assert_eq!(script.reconnects.borrow().len(), 0);
    }
}
