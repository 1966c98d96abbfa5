//! Formatter behaviour over real byte streams.

use std::sync::Arc;

use cinder_formatter::{
    BinaryBlockMatch, BinaryFormatter, BinarySchemata, Blob, EvaluationContext, TypeCat,
};

fn schemata(src: &str) -> Arc<BinarySchemata> {
    Arc::new(BinarySchemata::parse(src).unwrap())
}

fn formatter_over<'d, 'e>(
    data: &'d [u8],
    schemata: &Arc<BinarySchemata>,
    root: &str,
    eval: &'e mut EvaluationContext,
) -> BinaryFormatter<'d, 'e> {
    let mut formatter = BinaryFormatter::new(data, eval);
    formatter.push_pattern_by_name(schemata, root).unwrap();
    formatter
}

#[test]
fn conditional_member_skipped_when_flag_clear() {
    let schemata = schemata("block Foo { uint32 flag; if (flag) { uint32 payload; } }");
    let data = 0u32.to_le_bytes();
    let mut eval = EvaluationContext::new();
    let mut formatter = formatter_over(&data, &schemata, "Foo", &mut eval);

    assert_eq!(formatter.peek_next().unwrap(), Blob::KeyedItem);
    assert_eq!(formatter.try_keyed_item().unwrap().as_deref(), Some("flag"));
    assert_eq!(formatter.peek_next().unwrap(), Blob::ValueMember);
    let flag = formatter.try_raw_value().unwrap().unwrap();
    assert_eq!(flag.as_i64(&data, false), Some(0));

    // no payload surfaces; the root block simply finishes
    assert_eq!(formatter.peek_next().unwrap(), Blob::None);
}

#[test]
fn conditional_member_read_when_flag_set() {
    let schemata = schemata("block Foo { uint32 flag; if (flag) { uint32 payload; } }");
    let mut data = Vec::new();
    data.extend_from_slice(&1u32.to_le_bytes());
    data.extend_from_slice(&42u32.to_le_bytes());
    let mut eval = EvaluationContext::new();
    let mut formatter = formatter_over(&data, &schemata, "Foo", &mut eval);

    assert_eq!(formatter.try_keyed_item().unwrap().as_deref(), Some("flag"));
    let flag = formatter.try_raw_value().unwrap().unwrap();
    assert_eq!(flag.as_i64(&data, false), Some(1));

    assert_eq!(formatter.try_keyed_item().unwrap().as_deref(), Some("payload"));
    let payload = formatter.try_raw_value().unwrap().unwrap();
    assert_eq!(payload.as_i64(&data, false), Some(42));

    assert_eq!(formatter.peek_next().unwrap(), Blob::None);
}

#[test]
fn fixed_size_fast_skip_advances_without_element_walk() {
    let schemata = schemata(
        "block Item { uint32 a; uint32 b; }\n\
         block Outer { uint32 n; Item items[n]; }",
    );
    let count = 1000u32;
    let mut data = Vec::new();
    data.extend_from_slice(&count.to_le_bytes());
    for i in 0..count {
        data.extend_from_slice(&i.to_le_bytes());
        data.extend_from_slice(&(i * 2).to_le_bytes());
    }
    let mut eval = EvaluationContext::new();
    let mut formatter = formatter_over(&data, &schemata, "Outer", &mut eval);

    assert_eq!(formatter.try_keyed_item().unwrap().as_deref(), Some("n"));
    formatter.try_raw_value().unwrap().unwrap();

    assert_eq!(formatter.try_keyed_item().unwrap().as_deref(), Some("items"));
    let (read_count, _) = formatter.try_begin_array().unwrap().unwrap();
    assert_eq!(read_count, 1000);

    let before = formatter.position();
    let (start, end) = formatter.skip_array_elements(1000).unwrap();
    assert_eq!(start, before);
    assert_eq!(end - start, 1000 * 8);
    assert!(formatter.try_end_array().unwrap());
    assert_eq!(formatter.peek_next().unwrap(), Blob::None);
}

#[test]
fn nested_blocks_surface_begin_end_pairs() {
    let schemata = schemata(
        "block Inner { uint16 x; uint16 y; }\n\
         block Outer { Inner a; uint32 tail; }",
    );
    let mut data = Vec::new();
    data.extend_from_slice(&7u16.to_le_bytes());
    data.extend_from_slice(&9u16.to_le_bytes());
    data.extend_from_slice(&100u32.to_le_bytes());
    let mut eval = EvaluationContext::new();
    let mut formatter = formatter_over(&data, &schemata, "Outer", &mut eval);

    assert_eq!(formatter.try_keyed_item().unwrap().as_deref(), Some("a"));
    assert_eq!(formatter.peek_next().unwrap(), Blob::BeginBlock);
    let begin_cursor = formatter.position();
    formatter.try_begin_block().unwrap().unwrap();

    assert_eq!(formatter.try_keyed_item().unwrap().as_deref(), Some("x"));
    let x = formatter.try_raw_value().unwrap().unwrap();
    assert_eq!(x.as_i64(&data, false), Some(7));
    assert_eq!(formatter.try_keyed_item().unwrap().as_deref(), Some("y"));
    let y = formatter.try_raw_value().unwrap().unwrap();
    assert_eq!(y.as_i64(&data, false), Some(9));

    assert_eq!(formatter.peek_next().unwrap(), Blob::EndBlock);
    assert!(formatter.try_end_block().unwrap());

    // cursor at EndBlock equals cursor at BeginBlock plus member sizes
    assert_eq!(formatter.position(), begin_cursor + 4);

    assert_eq!(formatter.try_keyed_item().unwrap().as_deref(), Some("tail"));
    let tail = formatter.try_raw_value().unwrap().unwrap();
    assert_eq!(tail.as_i64(&data, false), Some(100));
}

#[test]
fn empty_input_yields_none_and_try_methods_fail() {
    let schemata = schemata("block Foo { uint32 flag; }");
    let mut eval = EvaluationContext::new();
    let mut formatter = BinaryFormatter::new(&[], &mut eval);
    assert_eq!(formatter.peek_next().unwrap(), Blob::None);
    assert!(formatter.try_keyed_item().unwrap().is_none());
    assert!(formatter.try_begin_block().unwrap().is_none());
    assert!(!formatter.try_end_block().unwrap());
    assert!(formatter.try_begin_array().unwrap().is_none());
    assert!(!formatter.try_end_array().unwrap());
    assert!(formatter.try_raw_value().unwrap().is_none());
    drop(formatter);

    // a pushed pattern over empty data fails with a bounds error once a
    // member read is attempted
    let mut eval = EvaluationContext::new();
    let mut formatter = formatter_over(&[], &schemata, "Foo", &mut eval);
    assert_eq!(formatter.peek_next().unwrap(), Blob::KeyedItem);
    formatter.try_keyed_item().unwrap();
    assert!(formatter.try_raw_value().is_err());
}

#[test]
fn over_read_reports_block_context() {
    let schemata = schemata(
        "block Inner { uint32 big; }\n\
         block Outer { Inner a; }",
    );
    let data = [0u8; 2]; // too short for Inner::big
    let mut eval = EvaluationContext::new();
    let mut formatter = formatter_over(&data, &schemata, "Outer", &mut eval);
    formatter.try_keyed_item().unwrap();
    formatter.try_begin_block().unwrap().unwrap();
    formatter.try_keyed_item().unwrap();
    let err = formatter.try_raw_value().unwrap_err();
    let message = err.to_string();
    assert!(message.contains("Inner \\ Outer"), "got: {message}");
}

#[test]
fn throw_statement_formats_message() {
    let schemata = schemata(
        "block Header { uint32 magic; if (magic != 0x1234) { throw \"bad magic {}\", magic; } }",
    );
    let data = 9u32.to_le_bytes();
    let mut eval = EvaluationContext::new();
    let mut formatter = formatter_over(&data, &schemata, "Header", &mut eval);
    formatter.try_keyed_item().unwrap();
    formatter.try_raw_value().unwrap().unwrap();
    let err = formatter.peek_next().unwrap_err();
    assert!(err.to_string().contains("bad magic 9"), "got: {err}");
}

#[test]
fn char_array_compresses_into_value_member() {
    let schemata = schemata("block Name { uint8 len; char text[len]; }");
    let mut data = vec![5u8];
    data.extend_from_slice(b"hello");
    let mut eval = EvaluationContext::new();
    let mut formatter = formatter_over(&data, &schemata, "Name", &mut eval);

    formatter.try_keyed_item().unwrap();
    formatter.try_raw_value().unwrap().unwrap();

    // the char array surfaces as one compressed value, not BeginArray
    assert_eq!(formatter.try_keyed_item().unwrap().as_deref(), Some("text"));
    assert_eq!(formatter.peek_next().unwrap(), Blob::ValueMember);
    let text = formatter.try_raw_value().unwrap().unwrap();
    assert_eq!(text.type_desc.array_count, 5);
    assert_eq!(text.bytes(&data), b"hello");
}

#[test]
fn block_array_surfaces_per_element_blocks() {
    let schemata = schemata(
        "block Point { float32 x; float32 y; }\n\
         block Path { uint32 n; Point points[n]; }",
    );
    let mut data = Vec::new();
    data.extend_from_slice(&2u32.to_le_bytes());
    for v in [1.0f32, 2.0, 3.0, 4.0] {
        data.extend_from_slice(&v.to_le_bytes());
    }
    let mut eval = EvaluationContext::new();
    let mut formatter = formatter_over(&data, &schemata, "Path", &mut eval);

    formatter.try_keyed_item().unwrap();
    formatter.try_raw_value().unwrap().unwrap();
    formatter.try_keyed_item().unwrap();
    let (count, _) = formatter.try_begin_array().unwrap().unwrap();
    assert_eq!(count, 2);

    for _ in 0..2 {
        assert_eq!(formatter.peek_next().unwrap(), Blob::BeginBlock);
        formatter.try_begin_block().unwrap().unwrap();
        formatter.try_keyed_item().unwrap();
        formatter.try_raw_value().unwrap().unwrap();
        formatter.try_keyed_item().unwrap();
        formatter.try_raw_value().unwrap().unwrap();
        assert!(formatter.try_end_block().unwrap());
    }
    assert_eq!(formatter.peek_next().unwrap(), Blob::EndArray);
    assert!(formatter.try_end_array().unwrap());
}

#[test]
fn expression_reads_prior_member_of_outer_block() {
    let schemata = schemata(
        "block Payload { uint8 data[outer_count]; }\n\
         block Envelope { uint32 outer_count; Payload payload; }",
    );
    let mut data = Vec::new();
    data.extend_from_slice(&3u32.to_le_bytes());
    data.extend_from_slice(&[0xAA, 0xBB, 0xCC]);
    let mut eval = EvaluationContext::new();
    let mut formatter = formatter_over(&data, &schemata, "Envelope", &mut eval);

    formatter.try_keyed_item().unwrap();
    formatter.try_raw_value().unwrap().unwrap();
    formatter.try_keyed_item().unwrap();
    formatter.try_begin_block().unwrap().unwrap();
    formatter.try_keyed_item().unwrap();
    let array = formatter.try_raw_value().unwrap().unwrap();
    assert_eq!(array.type_desc.array_count, 3);
    assert!(formatter.try_end_block().unwrap());
}

#[test]
fn global_parameters_feed_expressions() {
    let schemata = schemata("block Page { uint8 data[page_size]; }");
    let data = vec![0u8; 16];
    let mut eval = EvaluationContext::new();
    eval.set_global_parameter("page_size", 16);
    let mut formatter = formatter_over(&data, &schemata, "Page", &mut eval);
    formatter.try_keyed_item().unwrap();
    let value = formatter.try_raw_value().unwrap().unwrap();
    assert_eq!(value.type_desc.array_count, 16);
}

#[test]
fn block_match_captures_member_tree() {
    let schemata = schemata(
        "block Inner { uint16 x; }\n\
         block Root { uint32 id; Inner child; }",
    );
    let mut data = Vec::new();
    data.extend_from_slice(&77u32.to_le_bytes());
    data.extend_from_slice(&5u16.to_le_bytes());
    let mut eval = EvaluationContext::new();
    let mut formatter = formatter_over(&data, &schemata, "Root", &mut eval);

    let matched = BinaryBlockMatch::new(&mut formatter).unwrap();
    let id = matched.find("id").unwrap();
    assert_eq!(id.type_desc.unwrap().type_cat, TypeCat::UInt32);
    assert_eq!(&data[id.data_start..id.data_end], &77u32.to_le_bytes());

    let child = matched.find("child").unwrap();
    let child_index = matched.index_of(child);
    let x = matched.find_in(child_index, "x").unwrap();
    assert_eq!(&data[x.data_start..x.data_end], &5u16.to_le_bytes());
}

#[test]
fn speculative_consumers_leave_state_untouched() {
    let schemata = schemata("block Foo { uint32 value; }");
    let data = 11u32.to_le_bytes();
    let mut eval = EvaluationContext::new();
    let mut formatter = formatter_over(&data, &schemata, "Foo", &mut eval);

    formatter.try_keyed_item().unwrap();
    // wrong guesses: a block begin and an array begin both refuse
    assert!(formatter.try_begin_block().unwrap().is_none());
    assert!(formatter.try_begin_array().unwrap().is_none());
    // the value is still readable
    let value = formatter.try_raw_value().unwrap().unwrap();
    assert_eq!(value.as_i64(&data, false), Some(11));
}
