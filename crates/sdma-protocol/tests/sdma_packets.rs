use pretty_assertions::assert_eq;
use proptest::prelude::*;
use sdma_protocol::packets::*;
use sdma_protocol::{
    decode_command, CopyRectPacket, Dim3, GcrControl, SdmaCmdWriter, SdmaCommand, SdmaGeneration,
    SdmaV2, SdmaV4, SdmaV5,
};

fn copy_round_trip<G: SdmaGeneration>(dst: u64, src: u64, bytes: u32) -> SdmaCommand {
    let mut buf = [0u32; SdmaPktCopyLinear::SIZE_DWORDS];
    assert_eq!(
        encode_copy_linear::<G>(&mut buf, dst, src, bytes),
        SdmaPktCopyLinear::SIZE_DWORDS
    );
    let (cmd, len) = decode_command::<G>(&buf).unwrap();
    assert_eq!(len, SdmaPktCopyLinear::SIZE_DWORDS);
    cmd
}

proptest! {
    #[test]
    fn copy_linear_round_trips_on_every_generation(
        dst in any::<u64>(),
        src in any::<u64>(),
        bytes in 1u32..=0x003F_FFE0,
    ) {
        let expected = SdmaCommand::CopyLinear { dst, src, bytes };
        prop_assert_eq!(copy_round_trip::<SdmaV2>(dst, src, bytes), expected);
        prop_assert_eq!(copy_round_trip::<SdmaV4>(dst, src, bytes), expected);
        prop_assert_eq!(copy_round_trip::<SdmaV5>(dst, src, bytes), expected);
    }

    #[test]
    fn rect_fields_round_trip(
        log2 in 0u32..=4,
        ox in 0u32..(1 << 14), oy in 0u32..(1 << 14), oz in 0u32..(1 << 11),
        pitch in 1u32..=(1 << 19),
        slice in 1u32..=(1 << 28),
        rx in 1u32..=(1 << 14), ry in 1u32..=(1 << 14), rz in 1u32..=(1 << 11),
        addr in any::<u64>(),
    ) {
        let rect = CopyRectPacket {
            element_log2: log2,
            src_addr: addr,
            src_offset: Dim3::new(ox, oy, oz),
            src_pitch: pitch,
            src_slice_pitch: slice,
            dst_addr: !addr,
            dst_offset: Dim3::new(oz, ox, 0),
            dst_pitch: pitch,
            dst_slice_pitch: slice,
            rect: Dim3::new(rx, ry, rz),
        };
        let mut buf = [0u32; SdmaPktCopyLinearRect::SIZE_DWORDS];
        encode_copy_linear_rect(&mut buf, &rect);
        let (cmd, _) = decode_command::<SdmaV4>(&buf).unwrap();
        prop_assert_eq!(cmd, SdmaCommand::CopyLinearRect(rect));
    }
}

#[test]
fn packet_sizes_match_hardware_layouts() {
    assert_eq!(SdmaPktCopyLinear::SIZE_BYTES, 28);
    assert_eq!(SdmaPktCopyLinearRect::SIZE_BYTES, 52);
    assert_eq!(SdmaPktConstFill::SIZE_BYTES, 20);
    assert_eq!(SdmaPktFence::SIZE_BYTES, 16);
    assert_eq!(SdmaPktTrap::SIZE_BYTES, 8);
    assert_eq!(SdmaPktPollRegmem::SIZE_BYTES, 24);
    assert_eq!(SDMA_HDP_FLUSH_SIZE_BYTES, 24);
    assert_eq!(SdmaPktAtomic::SIZE_BYTES, 32);
    assert_eq!(SdmaPktTimestamp::SIZE_BYTES, 12);
    assert_eq!(SdmaPktGcr::SIZE_BYTES, 20);
    assert_eq!(SDMA_NOP_SIZE_BYTES, 4);
}

#[test]
fn async_submission_stream_decodes_in_order() {
    let mut w = SdmaCmdWriter::<SdmaV5>::new();
    w.wait_signal_zero(0x1000);
    w.timestamp(0x2008);
    w.copy_linear(0x8000, 0x9000, 256);
    w.gcr(0, GCR_LIMIT_VA_MAX, GcrControl::full_invalidate());
    w.timestamp(0x2010);
    w.atomic_decrement(0x2000);
    w.fence(0x3000, 42);
    w.trap(42);

    let mut dwords = w.as_dwords();
    let mut seen = Vec::new();
    while !dwords.is_empty() {
        let (cmd, len) = decode_command::<SdmaV5>(dwords).unwrap();
        seen.push(cmd);
        dwords = &dwords[len..];
    }

    assert_eq!(
        seen,
        vec![
            SdmaCommand::PollRegmem(sdma_protocol::PollParams::until_equal(0x1000, 0)),
            SdmaCommand::PollRegmem(sdma_protocol::PollParams::until_equal(0x1004, 0)),
            SdmaCommand::Timestamp { addr: 0x2008 },
            SdmaCommand::CopyLinear {
                dst: 0x8000,
                src: 0x9000,
                bytes: 256
            },
            SdmaCommand::Gcr {
                base: 0,
                limit: GCR_LIMIT_VA_MAX,
                control: GcrControl::full_invalidate()
            },
            SdmaCommand::Timestamp { addr: 0x2010 },
            SdmaCommand::Atomic {
                addr: 0x2000,
                op: SDMA_ATOMIC_ADD64,
                src: u64::MAX,
                cmp: 0,
                looped: false
            },
            SdmaCommand::Fence {
                addr: 0x3000,
                value: 42
            },
            SdmaCommand::Trap { int_ctx: 42 },
        ]
    );
}

#[test]
fn trap_context_is_truncated_to_28_bits() {
    let mut buf = [0u32; 2];
    encode_trap(&mut buf, 0xF123_4567);
    let (cmd, _) = decode_command::<SdmaV2>(&buf).unwrap();
    assert_eq!(cmd, SdmaCommand::Trap { int_ctx: 0x0123_4567 });
}

#[test]
fn unknown_opcode_is_rejected() {
    let buf = [header(0x3F, 0), 0, 0, 0];
    assert!(decode_command::<SdmaV4>(&buf).is_err());
}
