//! Per-VM RX/TX mailbox and the writable-notification lists.
//!
//! Every VM owns one wait entry per other VM. The entry of VM `A` for VM `X`
//! has two link slots: one in `X`'s waiter list (guarded by `X`'s lock) and
//! one in `A`'s ready list (guarded by `A`'s lock). The slots are stored in
//! the list owner's [`Mailbox`] and addressed by VM index, so moving an entry
//! never allocates.

use crate::config::MAX_VMS;
use crate::ffa::{FfaError, FfaValue};
use crate::vm::{vm_id_from_index, vm_index, VmId};
use crate::Paddr;

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum MailboxState {
    /// No message; the owner may receive one.
    Empty,
    /// A message arrived and has not been handed to the owner yet.
    Received,
    /// The owner has the message and must release it.
    Read,
}

/// Handle of the wait entry `owner` uses to wait on `for_vm`.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct WaitEntry {
    pub owner: VmId,
    pub for_vm: VmId,
}

#[derive(Debug, Default, Copy, Clone)]
struct Links {
    prev: Option<usize>,
    next: Option<usize>,
    linked: bool,
}

/// A doubly linked list of VM indexes with fixed link storage.
#[derive(Debug)]
pub struct IndexList {
    head: Option<usize>,
    tail: Option<usize>,
    links: [Links; MAX_VMS],
}

impl IndexList {
    pub const fn new() -> Self {
        const UNLINKED: Links = Links {
            prev: None,
            next: None,
            linked: false,
        };
        Self {
            head: None,
            tail: None,
            links: [UNLINKED; MAX_VMS],
        }
    }

    pub fn is_empty(&self) -> bool {
        self.head.is_none()
    }

    pub fn contains(&self, index: usize) -> bool {
        self.links[index].linked
    }

    /// Appends `index`. Returns false if it is already on the list.
    pub fn push_back(&mut self, index: usize) -> bool {
        if self.links[index].linked {
            return false;
        }
        self.links[index] = Links {
            prev: self.tail,
            next: None,
            linked: true,
        };
        match self.tail {
            Some(tail) => self.links[tail].next = Some(index),
            None => self.head = Some(index),
        }
        self.tail = Some(index);
        true
    }

    /// Unlinks `index`. Returns false if it was not on the list.
    pub fn remove(&mut self, index: usize) -> bool {
        let Links { prev, next, linked } = self.links[index];
        if !linked {
            return false;
        }
        match prev {
            Some(p) => self.links[p].next = next,
            None => self.head = next,
        }
        match next {
            Some(n) => self.links[n].prev = prev,
            None => self.tail = prev,
        }
        self.links[index] = Links::default();
        true
    }

    pub fn pop_front(&mut self) -> Option<usize> {
        let head = self.head?;
        self.remove(head);
        Some(head)
    }

    pub fn iter(&self) -> impl Iterator<Item = usize> + '_ {
        core::iter::successors(self.head, move |&i| self.links[i].next)
    }

    pub fn len(&self) -> usize {
        self.iter().count()
    }
}

impl Default for IndexList {
    fn default() -> Self {
        Self::new()
    }
}

/// What an RX buffer currently holds.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct ReceivedMessage {
    pub sender: VmId,
    pub size: u32,
    pub func: u32,
}

impl ReceivedMessage {
    /// The value that hands this message to its receiver.
    pub fn to_ffa_value(self, receiver: VmId) -> FfaValue {
        FfaValue::new(self.func)
            .with_arg1(crate::ffa::msg_send_attrs(self.sender, receiver))
            .with_arg3(self.size as u64)
    }
}

#[derive(Debug)]
pub struct Mailbox {
    pub state: MailboxState,
    /// TX page, read by the hypervisor.
    pub send: Option<Paddr>,
    /// RX page, written by the hypervisor.
    pub recv: Option<Paddr>,
    pub recv_sender: VmId,
    pub recv_size: u32,
    pub recv_func: u32,
    /// VMs waiting for this mailbox to become writable, by VM index.
    waiter_list: IndexList,
    /// VMs whose mailbox became writable since this VM waited on them.
    ready_list: IndexList,
    /// Waiters promoted by the last release, not yet reported to the primary.
    notify_list: IndexList,
}

impl Mailbox {
    pub const fn new() -> Self {
        Self {
            state: MailboxState::Empty,
            send: None,
            recv: None,
            recv_sender: 0,
            recv_size: 0,
            recv_func: 0,
            waiter_list: IndexList::new(),
            ready_list: IndexList::new(),
            notify_list: IndexList::new(),
        }
    }

    pub fn is_configured(&self) -> bool {
        self.send.is_some() && self.recv.is_some()
    }

    /// Whether a message can be delivered now.
    pub fn is_writable(&self) -> bool {
        self.state == MailboxState::Empty && self.recv.is_some()
    }

    /// EMPTY -> RECEIVED. The payload must already be in the RX page.
    pub fn receive(&mut self, sender: VmId, size: u32, func: u32) -> Result<(), FfaError> {
        if self.state != MailboxState::Empty {
            return Err(FfaError::Busy);
        }
        self.state = MailboxState::Received;
        self.recv_sender = sender;
        self.recv_size = size;
        self.recv_func = func;
        Ok(())
    }

    /// RECEIVED -> READ, handing the message to the owner.
    pub fn read(&mut self) -> Option<ReceivedMessage> {
        if self.state != MailboxState::Received {
            return None;
        }
        self.state = MailboxState::Read;
        Some(ReceivedMessage {
            sender: self.recv_sender,
            size: self.recv_size,
            func: self.recv_func,
        })
    }

    /// RECEIVED|READ -> EMPTY. Takes every waiter off the waiter list and
    /// returns their VM indexes; they are queued for reporting as well.
    pub fn release(&mut self) -> Result<WaiterDrain, FfaError> {
        match self.state {
            MailboxState::Received | MailboxState::Read => {}
            MailboxState::Empty => return Err(FfaError::Denied),
        }
        self.state = MailboxState::Empty;
        let mut drained = WaiterDrain::default();
        while let Some(index) = self.waiter_list.pop_front() {
            self.notify_list.push_back(index);
            drained.push(index);
        }
        Ok(drained)
    }

    /// Puts `waiter`'s entry on this mailbox's waiter list.
    pub fn add_waiter(&mut self, waiter: VmId) -> bool {
        self.waiter_list.push_back(vm_index(waiter))
    }

    pub fn is_waiting(&self, waiter: VmId) -> bool {
        self.waiter_list.contains(vm_index(waiter))
    }

    pub fn waiter_count(&self) -> usize {
        self.waiter_list.len()
    }

    /// Marks `for_vm` as writable for the owner of this mailbox. Returns
    /// false if it was already on the ready list.
    pub fn add_ready(&mut self, for_vm: VmId) -> bool {
        self.ready_list.push_back(vm_index(for_vm))
    }

    pub fn remove_ready(&mut self, for_vm: VmId) -> bool {
        self.ready_list.remove(vm_index(for_vm))
    }

    pub fn is_ready(&self, for_vm: VmId) -> bool {
        self.ready_list.contains(vm_index(for_vm))
    }

    pub fn ready_count(&self) -> usize {
        self.ready_list.len()
    }

    /// Next VM whose mailbox became writable for the owner.
    pub fn pop_ready(&mut self) -> Option<VmId> {
        self.ready_list.pop_front().map(vm_id_from_index)
    }

    /// Next waiter promoted by a release.
    pub fn pop_notify(&mut self) -> Option<VmId> {
        self.notify_list.pop_front().map(vm_id_from_index)
    }
}

impl Default for Mailbox {
    fn default() -> Self {
        Self::new()
    }
}

/// VM indexes taken off a waiter list.
#[derive(Debug, Default)]
pub struct WaiterDrain {
    indexes: [usize; MAX_VMS],
    len: usize,
}

impl WaiterDrain {
    fn push(&mut self, index: usize) {
        self.indexes[self.len] = index;
        self.len += 1;
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn vm_ids(&self) -> impl Iterator<Item = VmId> + '_ {
        self.indexes[..self.len].iter().map(|&i| vm_id_from_index(i))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn index_list_ops() {
        let mut list = IndexList::new();
        assert!(list.is_empty());
        assert!(list.push_back(3));
        assert!(list.push_back(1));
        assert!(list.push_back(7));
        assert!(!list.push_back(1));
        assert_eq!(list.iter().collect::<alloc::vec::Vec<_>>(), [3, 1, 7]);

        assert!(list.remove(1));
        assert!(!list.remove(1));
        assert_eq!(list.iter().collect::<alloc::vec::Vec<_>>(), [3, 7]);
        assert_eq!(list.pop_front(), Some(3));
        assert_eq!(list.pop_front(), Some(7));
        assert_eq!(list.pop_front(), None);
        assert!(list.push_back(1));
        assert_eq!(list.len(), 1);
    }

    #[test]
    fn state_machine() {
        let mut mb = Mailbox::new();
        assert_eq!(mb.read(), None);
        assert_eq!(mb.release().err(), Some(FfaError::Denied));

        mb.receive(2, 10, crate::ffa::FFA_MSG_SEND_32).unwrap();
        assert_eq!(mb.receive(3, 1, 0), Err(FfaError::Busy));
        let msg = mb.read().unwrap();
        assert_eq!((msg.sender, msg.size), (2, 10));
        assert_eq!(mb.read(), None);
        assert_eq!(mb.receive(3, 1, 0), Err(FfaError::Busy));
        assert!(mb.release().unwrap().is_empty());
        assert_eq!(mb.state, MailboxState::Empty);
    }

    #[test]
    fn release_drains_waiters() {
        let mut mb = Mailbox::new();
        mb.receive(2, 1, 0).unwrap();
        assert!(mb.add_waiter(3));
        assert!(mb.add_waiter(4));
        assert!(!mb.add_waiter(3));
        let drained = mb.release().unwrap();
        assert_eq!(drained.vm_ids().collect::<alloc::vec::Vec<_>>(), [3, 4]);
        assert_eq!(mb.waiter_count(), 0);
        assert_eq!(mb.pop_notify(), Some(3));
        assert_eq!(mb.pop_notify(), Some(4));
        assert_eq!(mb.pop_notify(), None);
    }
}
