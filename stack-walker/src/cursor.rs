use crate::{GIVE_UP_POINT, MachineContext, StackMemory};
use std::{iter::FusedIterator, mem};

/// Iterator over the frames of a stack, see the [crate](crate) docs for how
/// frames are found and when the walk stops.
pub struct FrameCursor<'mem, M: ?Sized> {
    memory: &'mem M,
    /// The snapshot's instruction pointer, until it has been yielded
    ip: Option<usize>,
    /// The next frame record to read
    frame_pointer: Option<usize>,
    /// Frame records live at or above the stack pointer of the snapshot
    stack_floor: usize,
    walked: usize,
}

impl<'mem, M: StackMemory + ?Sized> FrameCursor<'mem, M> {
    pub fn new(context: &MachineContext, memory: &'mem M) -> Self {
        Self {
            memory,
            ip: Some(context.instruction_pointer()),
            frame_pointer: Some(context.frame_pointer()),
            stack_floor: context.stack_pointer(),
            walked: 0,
        }
    }

    /// The number of frames yielded so far
    #[inline]
    pub fn walked(&self) -> usize {
        self.walked
    }

    #[inline]
    fn is_plausible(&self, frame_pointer: usize) -> bool {
        frame_pointer != 0
            && frame_pointer % mem::align_of::<usize>() == 0
            && frame_pointer >= self.stack_floor
    }
}

impl<M: StackMemory + ?Sized> Iterator for FrameCursor<'_, M> {
    type Item = usize;

    fn next(&mut self) -> Option<usize> {
        if self.walked >= GIVE_UP_POINT {
            return None;
        }

        let address = match self.ip.take() {
            Some(ip) => ip,
            None => {
                let frame_pointer = self
                    .frame_pointer
                    .take()
                    .filter(|fp| self.is_plausible(*fp))?;
                let record = self.memory.read_frame(frame_pointer)?;

                // Callers live further up the stack, so a link that doesn't
                // point above this record ends the chain, 0 included
                self.frame_pointer = (record.previous > frame_pointer).then_some(record.previous);
                record.return_address
            }
        };

        if address == 0 {
            self.frame_pointer = None;
            return None;
        }

        self.walked += 1;
        Some(address)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (0, Some(GIVE_UP_POINT - self.walked.min(GIVE_UP_POINT)))
    }
}

impl<M: StackMemory + ?Sized> FusedIterator for FrameCursor<'_, M> {}
