use core::fmt;

use crate::config::PAGE_SIZE;

macro_rules! def_addr {
    ($(#[$doc: meta])* $name: ident) => {
        $(#[$doc])*
        #[derive(Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
        #[repr(transparent)]
        pub struct $name(usize);

        impl $name {
            pub const fn new(addr: usize) -> Self {
                Self(addr)
            }

            pub const fn addr(self) -> usize {
                self.0
            }

            pub const fn add(self, offset: usize) -> Self {
                Self(self.0 + offset)
            }

            /// `None` if the result would wrap past the top of the address space.
            pub const fn checked_add(self, offset: usize) -> Option<Self> {
                match self.0.checked_add(offset) {
                    Some(addr) => Some(Self(addr)),
                    None => None,
                }
            }

            /// Distance in bytes from `base` up to `self`.
            pub const fn offset_from(self, base: Self) -> usize {
                self.0 - base.0
            }

            pub const fn align_down(self, align: usize) -> Self {
                Self(align_down(self.0, align))
            }

            pub const fn align_up(self, align: usize) -> Self {
                Self(align_up(self.0, align))
            }

            pub const fn is_aligned(self, align: usize) -> bool {
                is_aligned(self.0, align)
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
                write!(f, concat!(stringify!($name), "({:#x})"), self.0)
            }
        }

        impl fmt::LowerHex for $name {
            fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
                fmt::LowerHex::fmt(&self.0, f)
            }
        }
    };
}

def_addr!(
    /// Physical address.
    Paddr
);
def_addr!(
    /// Intermediate physical address, as seen by a VM through its stage-2 table.
    Ipaddr
);
def_addr!(
    /// Hypervisor virtual address (stage-1).
    Vaddr
);

pub const fn pa_from_ipa(ipa: Ipaddr) -> Paddr {
    Paddr(ipa.0)
}

pub const fn ipa_from_pa(pa: Paddr) -> Ipaddr {
    Ipaddr(pa.0)
}

pub const fn va_from_pa(pa: Paddr) -> Vaddr {
    Vaddr(pa.0)
}

pub const fn pa_from_va(va: Vaddr) -> Paddr {
    Paddr(va.0)
}

pub const fn align_down(addr: usize, align: usize) -> usize {
    addr & !(align - 1)
}

pub const fn align_up(addr: usize, align: usize) -> usize {
    (addr + align - 1) & !(align - 1)
}

pub const fn is_aligned(addr: usize, align: usize) -> bool {
    (addr & (align - 1)) == 0
}

pub const fn round_up_to_page(addr: usize) -> usize {
    align_up(addr, PAGE_SIZE)
}

pub const fn checked_round_up_to_page(addr: usize) -> Option<usize> {
    match addr.checked_add(PAGE_SIZE - 1) {
        Some(addr) => Some(align_down(addr, PAGE_SIZE)),
        None => None,
    }
}

pub const fn round_down_to_page(addr: usize) -> usize {
    align_down(addr, PAGE_SIZE)
}
