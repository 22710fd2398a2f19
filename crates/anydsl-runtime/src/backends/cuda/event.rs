//! Driver events

use std::any::Any;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use cudarc::driver::{self, result, sys};

use super::{driver_call, driver_error};
use crate::backend::{Event, EventStatus};
use crate::error::{Result, RuntimeError};
use crate::log::Diagnostics;

struct RawEvent(sys::CUevent);

// SAFETY: driver events may be used from any thread once their context is bound.
unsafe impl Send for RawEvent {}
unsafe impl Sync for RawEvent {}

pub struct CudaEvent {
    context: Arc<driver::CudaDevice>,
    diagnostics: Arc<Diagnostics>,
    event: RawEvent,
    recorded: AtomicBool,
}

impl CudaEvent {
    pub(crate) fn new(context: Arc<driver::CudaDevice>, diagnostics: Arc<Diagnostics>) -> Result<Self> {
        context
            .bind_to_thread()
            .map_err(|err| driver_error(&diagnostics, "cuCtxSetCurrent", err))?;
        let event = result::event::create(sys::CUevent_flags::CU_EVENT_DEFAULT)
            .map_err(|err| driver_error(&diagnostics, "cuEventCreate", err))?;

        Ok(Self {
            context,
            diagnostics,
            event: RawEvent(event),
            recorded: AtomicBool::new(false),
        })
    }

    fn bind(&self) -> Result<()> {
        self.context
            .bind_to_thread()
            .map_err(|err| driver_error(&self.diagnostics, "cuCtxSetCurrent", err))
    }

    /// Non-blocking completion check of the last recorded work.
    fn is_complete(&self) -> Result<bool> {
        // SAFETY: the event is live.
        match unsafe { sys::lib().cuEventQuery(self.event.0) } {
            sys::CUresult::CUDA_SUCCESS => Ok(true),
            sys::CUresult::CUDA_ERROR_NOT_READY => Ok(false),
            status => Err(driver_error(&self.diagnostics, "cuEventQuery", driver::DriverError(status))),
        }
    }

    /// Elapsed time between two recorded events, `None` while either is pending.
    fn elapsed_between(&self, start: &CudaEvent, end: &CudaEvent) -> Result<Option<f32>> {
        // SAFETY: both events are live and were recorded.
        match unsafe { result::event::elapsed(start.event.0, end.event.0) } {
            Ok(ms) => Ok(Some(ms)),
            Err(err) if err.0 == sys::CUresult::CUDA_ERROR_NOT_READY => Ok(None),
            Err(err) => Err(driver_error(&self.diagnostics, "cuEventElapsedTime", err)),
        }
    }
}

impl Drop for CudaEvent {
    fn drop(&mut self) {
        if self.context.bind_to_thread().is_ok() {
            // SAFETY: the event is destroyed once.
            let _ = unsafe { result::event::destroy(self.event.0) };
        }
    }
}

impl Event for CudaEvent {
    fn record(&self) -> Result<()> {
        self.bind()?;
        // SAFETY: the event and the default stream belong to the bound context.
        unsafe { result::event::record(self.event.0, *self.context.cu_stream()) }
            .map_err(|err| driver_error(&self.diagnostics, "cuEventRecord", err))?;
        self.recorded.store(true, Ordering::Release);
        Ok(())
    }

    fn query(&self, other: Option<&dyn Event>, elapsed: bool) -> Result<EventStatus> {
        let other = match other {
            Some(other) => Some(
                other
                    .as_any()
                    .downcast_ref::<CudaEvent>()
                    .ok_or_else(|| RuntimeError::device_mismatch("CUDA event", "non-CUDA event"))?,
            ),
            None => None,
        };
        if !self.recorded.load(Ordering::Acquire) || other.is_some_and(|o| !o.recorded.load(Ordering::Acquire)) {
            return Ok(EventStatus::NotReady);
        }
        self.bind()?;

        if !self.is_complete()? || other.map(CudaEvent::is_complete).transpose()? == Some(false) {
            return Ok(EventStatus::NotReady);
        }
        if !elapsed {
            return Ok(EventStatus::Complete { elapsed_ms: None });
        }

        let end = other.ok_or_else(|| RuntimeError::invalid_pointer("elapsed time needs an end event"))?;
        let Some(ms) = self.elapsed_between(self, end)? else {
            return Ok(EventStatus::NotReady);
        };
        Ok(EventStatus::Complete { elapsed_ms: Some(ms) })
    }

    fn sync(&self) -> Result<()> {
        if !self.recorded.load(Ordering::Acquire) {
            return Ok(());
        }
        self.bind()?;
        // SAFETY: the event is live and belongs to the bound context.
        let status = unsafe { sys::lib().cuEventSynchronize(self.event.0) };
        driver_call(&self.diagnostics, "cuEventSynchronize", status)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}
