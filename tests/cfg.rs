use kestrel_gpu_shader::cfg::parse_control_flow;
use kestrel_gpu_shader::ucode::CfInstruction;

#[test]
fn single_exec_end_yields_one_node() {
    let records = vec![CfInstruction::exec_end(0, 2)];
    let nodes = parse_control_flow(&records).unwrap();

    assert_eq!(nodes.len(), 1);
    assert_eq!(nodes[0].start, 0);
    assert_eq!(nodes[0].end, 1);
    assert_eq!(nodes[0].fallthrough, None);
    assert!(nodes[0].end_of_program);
}

#[test]
fn straight_line_records_merge_into_one_node() {
    let records = vec![
        CfInstruction::nop(),
        CfInstruction::fetch(0, 1),
        CfInstruction::exec(0, 4),
        CfInstruction::emit(0, 1).with_end_of_program(),
    ];
    let nodes = parse_control_flow(&records).unwrap();

    assert_eq!(nodes.len(), 1);
    assert_eq!(nodes[0].start, 0);
    assert_eq!(nodes[0].end, 4);
    assert!(nodes[0].end_of_program);
}

#[test]
fn branches_cut_nodes_at_contiguous_boundaries() {
    // exec / jump / exec / jump / exec_end: each jump starts a new node.
    let records = vec![
        CfInstruction::exec(0, 1),
        CfInstruction::jump(3, 0),
        CfInstruction::exec(1, 1),
        CfInstruction::jump(5, 0),
        CfInstruction::exec_end(2, 1),
    ];
    let nodes = parse_control_flow(&records).unwrap();

    assert_eq!(nodes.len(), 3);
    assert_eq!(nodes[0].start, 0);
    for pair in nodes.windows(2) {
        assert_eq!(pair[0].end, pair[1].start, "node ranges must be contiguous");
        assert_eq!(pair[0].fallthrough, Some(pair[1].start));
    }
    let last = nodes.last().unwrap();
    assert_eq!(last.end, records.len() as u32);
    assert!(last.end_of_program);
    assert!(nodes[..nodes.len() - 1].iter().all(|n| !n.end_of_program));
}

#[test]
fn end_of_program_flag_on_merged_alu_record_stops_parsing() {
    // The trailing record is never reached.
    let records = vec![
        CfInstruction::exec(0, 1).with_end_of_program(),
        CfInstruction::nop(),
    ];
    let nodes = parse_control_flow(&records).unwrap();

    assert_eq!(nodes.len(), 1);
    assert_eq!(nodes[0].end, 1);
    assert!(nodes[0].end_of_program);
}

#[test]
fn empty_stream_is_rejected() {
    let err = parse_control_flow(&[]).unwrap_err();
    assert!(err.message.contains("empty"), "{err}");
}

#[test]
fn missing_end_of_program_is_rejected() {
    let records = vec![CfInstruction::exec(0, 1), CfInstruction::nop()];
    let err = parse_control_flow(&records).unwrap_err();
    assert!(err.message.contains("end-of-program"), "{err}");
    assert_eq!(err.address, 1);
}

#[test]
fn conditional_jump_is_an_explicit_unimplemented_failure() {
    let records = vec![
        CfInstruction::exec(0, 1),
        CfInstruction::jump(2, 3),
        CfInstruction::exec_end(1, 1),
    ];
    let err = parse_control_flow(&records).unwrap_err();
    assert!(err.message.contains("conditional jump"), "{err}");
    assert_eq!(err.address, 1);
}

#[test]
fn call_and_return_are_explicit_unimplemented_failures() {
    let records = vec![CfInstruction::call(4, 1), CfInstruction::exec_end(0, 1)];
    let err = parse_control_flow(&records).unwrap_err();
    assert!(err.message.contains("call"), "{err}");
}

#[test]
fn unknown_opcode_is_rejected_with_its_raw_value() {
    let records = vec![CfInstruction(0x7F), CfInstruction::exec_end(0, 1)];
    let err = parse_control_flow(&records).unwrap_err();
    assert!(err.message.contains("0x7f"), "{err}");
}

#[test]
fn oversized_clause_count_is_rejected() {
    let records = vec![CfInstruction::exec(0, 200).with_end_of_program()];
    let err = parse_control_flow(&records).unwrap_err();
    assert!(err.message.contains("exceeds"), "{err}");

    let records = vec![CfInstruction::fetch(0, 200), CfInstruction::exec_end(0, 1)];
    let err = parse_control_flow(&records).unwrap_err();
    assert!(err.message.contains("exceeds"), "{err}");
}
