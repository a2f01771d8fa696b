use bit_field::BitField;

numeric_enum_macro::numeric_enum! {
    #[repr(u8)]
    #[derive(Debug, Copy, Clone, Eq, PartialEq)]
    /// Interrupt class, as encoded in the descriptor.
    pub enum InterruptType {
        Sgi = 0,
        Ppi = 1,
        Spi = 2,
    }
}

/// One interrupt a partition's manifest declares.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct InterruptDescriptor {
    pub interrupt_id: u32,
    /// Bit 0: security state, bit 1: config, bits 2..4: type.
    type_config_sec_state: u8,
    pub priority: u8,
    pub valid: bool,
}

impl InterruptDescriptor {
    pub fn new(interrupt_id: u32, ty: InterruptType, priority: u8) -> Self {
        let mut desc = Self {
            interrupt_id,
            type_config_sec_state: 0,
            priority,
            valid: true,
        };
        desc.set_type(ty);
        desc
    }

    pub fn sec_state(&self) -> u8 {
        self.type_config_sec_state.get_bits(0..1)
    }

    pub fn set_sec_state(&mut self, sec_state: u8) {
        self.type_config_sec_state.set_bits(0..1, sec_state & 1);
    }

    pub fn config(&self) -> u8 {
        self.type_config_sec_state.get_bits(1..2)
    }

    pub fn set_config(&mut self, config: u8) {
        self.type_config_sec_state.set_bits(1..2, config & 1);
    }

    /// `None` for the reserved encoding.
    pub fn ty(&self) -> Option<InterruptType> {
        InterruptType::try_from(self.type_config_sec_state.get_bits(2..4)).ok()
    }

    pub fn set_type(&mut self, ty: InterruptType) {
        self.type_config_sec_state.set_bits(2..4, ty as u8);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bitfields() {
        let mut desc = InterruptDescriptor::new(34, InterruptType::Spi, 0x80);
        assert_eq!(desc.ty(), Some(InterruptType::Spi));
        assert_eq!(desc.sec_state(), 0);
        desc.set_sec_state(1);
        desc.set_config(1);
        assert_eq!(desc.sec_state(), 1);
        assert_eq!(desc.config(), 1);
        assert_eq!(desc.ty(), Some(InterruptType::Spi));
        desc.set_type(InterruptType::Ppi);
        assert_eq!(desc.ty(), Some(InterruptType::Ppi));
        assert_eq!(desc.config(), 1);
        assert!(desc.valid);
        assert!(!InterruptDescriptor::default().valid);
    }
}
