#[cfg(all(loom, shuttle))]
compile_error!("cannot use loom and shuttle at once");

#[cfg(loom)]
pub(crate) mod alloc {
  pub(crate) use ::loom::alloc::Layout;
  pub(crate) use ::loom::alloc::alloc;
  pub(crate) use ::loom::alloc::dealloc;
  pub(crate) use ::std::alloc::handle_alloc_error;
}

#[cfg(not(loom))]
pub(crate) mod alloc {
  pub(crate) use ::std::alloc::Layout;
  pub(crate) use ::std::alloc::alloc;
  pub(crate) use ::std::alloc::dealloc;
  pub(crate) use ::std::alloc::handle_alloc_error;
}

#[cfg(not(any(loom, shuttle)))]
pub(crate) mod sync {
  pub(crate) mod atomic {
    pub(crate) use ::core::sync::atomic::AtomicBool;
    pub(crate) use ::core::sync::atomic::AtomicI64;
    pub(crate) use ::core::sync::atomic::AtomicPtr;
    pub(crate) use ::core::sync::atomic::AtomicU64;
    pub(crate) use ::core::sync::atomic::AtomicUsize;
    pub(crate) use ::core::sync::atomic::Ordering;
  }

  pub(crate) mod hint {
    pub(crate) use ::core::hint::spin_loop;
  }
}

#[cfg(loom)]
pub(crate) mod sync {
  pub(crate) mod atomic {
    pub(crate) use ::loom::sync::atomic::AtomicBool;
    pub(crate) use ::loom::sync::atomic::AtomicI64;
    pub(crate) use ::loom::sync::atomic::AtomicPtr;
    pub(crate) use ::loom::sync::atomic::AtomicU64;
    pub(crate) use ::loom::sync::atomic::AtomicUsize;
    pub(crate) use ::loom::sync::atomic::Ordering;
  }

  pub(crate) mod hint {
    pub(crate) use ::loom::hint::spin_loop;
  }
}

#[cfg(shuttle)]
pub(crate) mod sync {
  pub(crate) mod atomic {
    pub(crate) use ::shuttle::sync::atomic::AtomicBool;
    pub(crate) use ::shuttle::sync::atomic::AtomicI64;
    pub(crate) use ::shuttle::sync::atomic::AtomicPtr;
    pub(crate) use ::shuttle::sync::atomic::AtomicU64;
    pub(crate) use ::shuttle::sync::atomic::AtomicUsize;
    pub(crate) use ::shuttle::sync::atomic::Ordering;
  }

  pub(crate) mod hint {
    pub(crate) use ::shuttle::thread::yield_now as spin_loop;
  }
}
