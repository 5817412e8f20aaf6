//! Error types returned by the kernel services.
//!
//! Every service returns a dedicated error enum listing exactly the failures
//! that service can report. The enums share variants; the shared variants are
//! modeled as *suberror* types with `From` conversions so that internal code
//! can return, say, [`BadContextError`] and have it lifted into whichever
//! public error type the caller needs.
use core::fmt;

macro_rules! define_error {
    (
        $( #[doc = $doc:literal] )*
        pub enum $Name:ident {
            $(
                $( #[doc = $vdoc:literal] )*
                $Variant:ident
            ),* $(,)?
        }
    ) => {
        $( #[doc = $doc] )*
        #[derive(Debug, Clone, Copy, PartialEq, Eq)]
        pub enum $Name {
            $(
                $( #[doc = $vdoc] )*
                $Variant,
            )*
        }

        impl fmt::Display for $Name {
            fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
                fmt::Debug::fmt(self, f)
            }
        }
    };
}

macro_rules! define_suberror_from {
    ( $Name:ident { $( $Variant:ident ),* $(,)? } => $Supererror:path ) => {
        impl From<$Name> for $Supererror {
            #[inline]
            fn from(x: $Name) -> Self {
                match x {
                    $( $Name::$Variant => Self::$Variant, )*
                }
            }
        }
    };
}

macro_rules! define_suberror {
    (
        $( #[doc = $doc:literal] )*
        $( #[into( $Supererror:path )] )*
        $vis:vis enum $Name:ident
        $variants:tt
    ) => {
        $( #[doc = $doc] )*
        #[derive(Debug, Clone, Copy, PartialEq, Eq)]
        $vis enum $Name $variants

        $(
            define_suberror_from! { $Name $variants => $Supererror }
        )*
    };
}

define_error! {
    /// Error type for [`System::init`](crate::System::init).
    pub enum InitError {
        /// The system has already been initialized.
        AlreadyInit,
        /// The scheduler lock is held (the kernel was reentered).
        BadContext,
    }
}

define_error! {
    /// Error type for [`System::create`](crate::System::create).
    pub enum CreateError {
        /// The system is not initialized, or the calling context cannot block.
        BadContext,
        /// The stack buffer is too small to hold the task record and a usable
        /// stack.
        BadParam,
    }
}

define_error! {
    /// Error type for [`System::join`](crate::System::join).
    pub enum JoinError {
        /// The system is not initialized, or the calling context cannot block.
        BadContext,
        /// The calling task attempted to join itself.
        WouldDeadlock,
    }
}

define_error! {
    /// Error type for [`System::yield_now`](crate::System::yield_now).
    pub enum YieldError {
        /// The system is not initialized, or the calling context cannot block.
        BadContext,
    }
}

define_error! {
    /// Error type for [`System::sleep`](crate::System::sleep).
    pub enum SleepError {
        /// The system is not initialized, or the calling context cannot block.
        BadContext,
        /// The duration does not fit in the timer's window.
        BadParam,
    }
}

define_error! {
    /// Error type for [`System::current_task`](crate::System::current_task).
    pub enum GetCurrentTaskError {
        /// The system is not initialized, or the scheduler lock is held.
        BadContext,
    }
}

define_error! {
    /// Error type for [`System::time_ticks`](crate::System::time_ticks).
    pub enum TimeError {
        /// The system is not initialized, or the scheduler lock is held.
        BadContext,
    }
}

define_error! {
    /// Error type for [`Mutex::lock`](crate::Mutex::lock).
    pub enum LockMutexError {
        /// The system is not initialized, or the calling context cannot block.
        BadContext,
        /// The calling task already owns the mutex.
        WouldDeadlock,
    }
}

define_error! {
    /// Error type for [`Mutex::unlock`](crate::Mutex::unlock).
    pub enum UnlockMutexError {
        /// The system is not initialized, or the scheduler lock is held.
        BadContext,
        /// The calling task does not own the mutex.
        NotOwner,
    }
}

define_error! {
    /// Error type for [`Mutex::is_locked`](crate::Mutex::is_locked).
    pub enum QueryMutexError {
        /// The system is not initialized, or the scheduler lock is held.
        BadContext,
    }
}

define_error! {
    /// Error type for [`Event::wait`](crate::Event::wait).
    pub enum WaitEventError {
        /// The system is not initialized, or the calling context cannot block.
        BadContext,
    }
}

define_error! {
    /// Error type for [`Event::wait_timeout`](crate::Event::wait_timeout).
    pub enum WaitEventTimeoutError {
        /// The system is not initialized, or the calling context cannot block.
        BadContext,
        /// The duration does not fit in the timer's window.
        BadParam,
        /// The timeout expired before the event was signaled.
        Timeout,
    }
}

define_error! {
    /// Error type for [`Event::set`](crate::Event::set) and
    /// [`Event::clear`](crate::Event::clear).
    pub enum UpdateEventError {
        /// The system is not initialized, or the scheduler lock is held.
        BadContext,
    }
}

define_suberror! {
    /// `BadContext`
    #[into(InitError)]
    #[into(CreateError)]
    #[into(JoinError)]
    #[into(YieldError)]
    #[into(SleepError)]
    #[into(GetCurrentTaskError)]
    #[into(TimeError)]
    #[into(LockMutexError)]
    #[into(UnlockMutexError)]
    #[into(QueryMutexError)]
    #[into(WaitEventError)]
    #[into(WaitEventTimeoutError)]
    #[into(UpdateEventError)]
    pub(super) enum BadContextError {
        BadContext,
    }
}

define_suberror! {
    /// `BadParam`
    #[into(CreateError)]
    #[into(SleepError)]
    #[into(WaitEventTimeoutError)]
    pub(super) enum BadParamError {
        BadParam,
    }
}

define_suberror! {
    /// The result of a bounded wait, stored in the task record by whoever
    /// wakes the task up.
    #[into(WaitEventTimeoutError)]
    pub(crate) enum WaitTimeoutError {
        Timeout,
    }
}

/// Convert a wait result to `()`, panicking if it is `Err(Timeout)`.
///
/// Used by unbounded waits, which can never observe a timeout.
#[inline]
pub(super) fn expect_not_timeout(e: WaitTimeoutError) -> core::convert::Infallible {
    match e {
        WaitTimeoutError::Timeout => {
            unreachable!("got timeout result for a non-timeout wait")
        }
    }
}
