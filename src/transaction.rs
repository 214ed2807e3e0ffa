//! The transaction manager: an ordered list of (do, undo) steps, committed
//! in order, rolled back (inverses run in reverse) on the first failure.
//!
//! The manager is generic over the context `T` its steps operate on (in
//! this crate, `T` is always [`crate::fs::FileSystem`]) and is otherwise
//! oblivious to what its steps actually do on disk — correctness depends
//! on the caller registering true inverses, exactly as `spec.md` §4.9
//! describes. Reified as boxed `FnOnce(&mut T) -> Result<()>` closures
//! rather than the original's `(func, args, rollback, rollback_args)`
//! tuples, since Rust closures already capture their arguments.

use crate::error::Result;

type Action<T> = Box<dyn FnOnce(&mut T) -> Result<()>>;

struct Step<T> {
    do_action: Action<T>,
    undo_action: Option<Action<T>>,
}

/// Accumulates pending steps and commits them as a unit.
pub struct Transaction<T> {
    steps: Vec<Step<T>>,
    committing: bool,
}

impl<T> Default for Transaction<T> {
    fn default() -> Self {
        Self {
            steps: Vec::new(),
            committing: false,
        }
    }
}

impl<T> Transaction<T> {
    /// Creates an empty transaction.
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a step. `undo` is run, in reverse order among all steps
    /// already executed, if a later step fails.
    pub fn push(&mut self, do_action: Action<T>, undo_action: Option<Action<T>>) {
        self.steps.push(Step {
            do_action,
            undo_action,
        });
    }

    /// Runs every pending step in order against `ctx`. If a step fails,
    /// runs the inverses of every step that already succeeded, in reverse
    /// order, then returns the original error.
    ///
    /// A re-entrant call (from within a step that itself calls `commit`
    /// on the same transaction) is a silent no-op, which is what lets
    /// higher-level operations compose by appending to an already-open
    /// transaction's step list.
    pub fn commit(&mut self, ctx: &mut T) -> Result<()> {
        if self.committing {
            return Ok(());
        }
        self.committing = true;

        let steps = std::mem::take(&mut self.steps);
        let mut executed_undo: Vec<Action<T>> = Vec::with_capacity(steps.len());

        let outcome = (|| {
            for step in steps {
                (step.do_action)(ctx)?;
                if let Some(undo) = step.undo_action {
                    executed_undo.push(undo);
                }
            }
            Ok(())
        })();

        if let Err(err) = outcome {
            log::warn!("transaction failed, rolling back {} step(s): {err}", executed_undo.len());
            for undo in executed_undo.into_iter().rev() {
                if let Err(undo_err) = undo(ctx) {
                    log::error!("rollback step itself failed: {undo_err}");
                }
            }
            self.steps.clear();
            self.committing = false;
            return Err(err);
        }

        self.steps.clear();
        self.committing = false;
        Ok(())
    }

    /// Whether any steps are currently pending.
    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Counter {
        value: i32,
        log: Vec<&'static str>,
    }

    #[test]
    fn commit_runs_steps_in_order() {
        let mut txn = Transaction::new();
        txn.push(
            Box::new(|c: &mut Counter| {
                c.value += 1;
                c.log.push("do1");
                Ok(())
            }),
            Some(Box::new(|c: &mut Counter| {
                c.value -= 1;
                Ok(())
            })),
        );
        txn.push(
            Box::new(|c: &mut Counter| {
                c.value += 10;
                c.log.push("do2");
                Ok(())
            }),
            Some(Box::new(|c: &mut Counter| {
                c.value -= 10;
                Ok(())
            })),
        );

        let mut counter = Counter::default();
        txn.commit(&mut counter).unwrap();
        assert_eq!(counter.value, 11);
        assert_eq!(counter.log, vec!["do1", "do2"]);
        assert!(txn.is_empty());
    }

    #[test]
    fn failure_rolls_back_in_reverse_order() {
        use crate::error::Error;

        let mut txn = Transaction::new();
        txn.push(
            Box::new(|c: &mut Counter| {
                c.value += 1;
                c.log.push("do1");
                Ok(())
            }),
            Some(Box::new(|c: &mut Counter| {
                c.log.push("undo1");
                c.value -= 1;
                Ok(())
            })),
        );
        txn.push(
            Box::new(|c: &mut Counter| {
                c.value += 10;
                c.log.push("do2");
                Ok(())
            }),
            Some(Box::new(|c: &mut Counter| {
                c.log.push("undo2");
                c.value -= 10;
                Ok(())
            })),
        );
        txn.push(
            Box::new(|_: &mut Counter| {
                Err(Error::NoIndexSpace)
            }),
            None,
        );

        let mut counter = Counter::default();
        let err = txn.commit(&mut counter).unwrap_err();
        assert!(matches!(err, Error::NoIndexSpace));
        assert_eq!(counter.value, 0);
        assert_eq!(counter.log, vec!["do1", "do2", "undo2", "undo1"]);
    }

    #[test]
    fn reentrant_commit_is_a_no_op() {
        let mut txn: Transaction<Counter> = Transaction::new();
        txn.committing = true;
        let mut counter = Counter::default();
        txn.commit(&mut counter).unwrap();
        assert_eq!(counter.value, 0);
    }
}
