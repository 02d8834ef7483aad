/// Coarse flow-correlation key: `src_addr ^ dst_addr ^ protocol`.
///
/// One XOR chain, no branches and no memory access. It is a grouping hint,
/// not a flow identifier: the key is symmetric in source and destination, so
/// both directions of a conversation share it, and any two address pairs with
/// the same XOR collide. Consumers must tolerate false-positive grouping.
#[inline(always)]
pub const fn flow_hash(src_addr: u32, dst_addr: u32, protocol: u8) -> u32 {
    src_addr ^ dst_addr ^ protocol as u32
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{IPPROTO_TCP, IPPROTO_UDP};

    fn addr(octets: [u8; 4]) -> u32 {
        u32::from_ne_bytes(octets)
    }

    #[test]
    fn test_same_triple_same_key() {
        let a = flow_hash(addr([10, 0, 0, 1]), addr([10, 0, 0, 2]), IPPROTO_TCP);
        let b = flow_hash(addr([10, 0, 0, 1]), addr([10, 0, 0, 2]), IPPROTO_TCP);
        assert_eq!(a, b);
    }

    #[test]
    fn test_any_field_change_alters_key() {
        let base = flow_hash(addr([10, 0, 0, 1]), addr([10, 0, 0, 2]), IPPROTO_TCP);
        assert_ne!(base, flow_hash(addr([10, 0, 0, 3]), addr([10, 0, 0, 2]), IPPROTO_TCP));
        assert_ne!(base, flow_hash(addr([10, 0, 0, 1]), addr([10, 0, 0, 4]), IPPROTO_TCP));
        assert_ne!(base, flow_hash(addr([10, 0, 0, 1]), addr([10, 0, 0, 2]), IPPROTO_UDP));
    }

    #[test]
    fn test_swapped_addresses_collide() {
        // Accepted: forward and reverse directions group together.
        let forward = flow_hash(addr([10, 0, 0, 1]), addr([10, 0, 0, 2]), IPPROTO_TCP);
        let reverse = flow_hash(addr([10, 0, 0, 2]), addr([10, 0, 0, 1]), IPPROTO_TCP);
        assert_eq!(forward, reverse);
    }

    #[test]
    fn test_equal_xor_pairs_collide() {
        // Accepted: 10.0.0.1 ^ 10.0.0.2 == 10.0.0.5 ^ 10.0.0.6
        let a = flow_hash(addr([10, 0, 0, 1]), addr([10, 0, 0, 2]), IPPROTO_UDP);
        let b = flow_hash(addr([10, 0, 0, 5]), addr([10, 0, 0, 6]), IPPROTO_UDP);
        assert_eq!(a, b);
    }
}
