//! What the rooting checks know about the VM's C API.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::roots::paths::DEFAULT_MAX_PATHS;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("could not parse rooting config as TOML")]
    Toml(#[from] toml::de::Error),
}

/// Names of the types and functions the checks care about. Every list can
/// be replaced from TOML; anything left out keeps its default.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RootingConfig {
    /// Pointer types whose referents the collector may move.
    pub tracked_types: BTreeSet<String>,
    /// Pointer types always allocated straight into gen2. Rooting them
    /// does nothing.
    pub gen2_types: BTreeSet<String>,
    /// Functions that may trigger a collection.
    pub allocators: BTreeSet<String>,

    pub root_push: String,
    /// Position of the rooted address among the push call's arguments.
    pub root_push_arg: usize,
    pub root_pop: String,
    pub root_pop_n: String,
    pub root_pop_n_arg: usize,

    /// Calls that make every following allocation go to gen2, and undo it.
    pub gen2_default_set: String,
    pub gen2_default_clear: String,
    /// Serialization primitives that always allocate in gen2.
    pub serialization_refs: BTreeSet<String>,

    pub throw: String,
    pub malloc_like: BTreeSet<String>,
    pub free_like: BTreeSet<String>,

    /// Give up on a procedure once this many paths reach one block.
    pub max_paths: usize,
}

fn set(names: &[&str]) -> BTreeSet<String> {
    names.iter().map(|s| s.to_string()).collect()
}

impl Default for RootingConfig {
    fn default() -> Self {
        Self {
            tracked_types: set(TRACKED_TYPES),
            gen2_types: set(GEN2_TYPES),
            allocators: set(ALLOCATORS),
            root_push: "MVM_gc_root_temp_push".into(),
            root_push_arg: 1,
            root_pop: "MVM_gc_root_temp_pop".into(),
            root_pop_n: "MVM_gc_root_temp_pop_n".into(),
            root_pop_n_arg: 1,
            gen2_default_set: "MVM_gc_allocate_gen2_default_set".into(),
            gen2_default_clear: "MVM_gc_allocate_gen2_default_clear".into(),
            serialization_refs: set(&["MVM_serialization_read_ref", "MVM_serialization_write_ref"]),
            throw: "MVM_exception_throw_adhoc".into(),
            malloc_like: set(MALLOC_LIKE),
            free_like: set(FREE_LIKE),
            max_paths: DEFAULT_MAX_PATHS,
        }
    }
}

impl RootingConfig {
    pub fn from_toml(text: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(text)?)
    }

    pub fn is_tracked(&self, ty: &str) -> bool {
        self.tracked_types.contains(ty)
    }

    pub fn is_gen2(&self, ty: &str) -> bool {
        self.gen2_types.contains(ty)
    }
}

// CompUnit and StaticFrameSpesh are missing on purpose: they are always
// allocated in gen2.
const TRACKED_TYPES: &[&str] = &[
    "struct MVMCollectable *",
    "struct MVMObject *",
    "struct MVMObjectStooge *",
    "struct MVMSTable *",
    "struct MVMFrame *",
    "struct MVMArray *",
    "struct MVMAsyncTask *",
    "struct MVMCArray *",
    "struct MVMCFunction *",
    "struct MVMCPPStruct *",
    "struct MVMCPointer *",
    "struct MVMCStr *",
    "struct MVMCStruct *",
    "struct MVMCUnion *",
    "struct MVMCallCapture *",
    "struct MVMCode *",
    "struct MVMConcBlockingQueue *",
    "struct MVMConditionVariable *",
    "struct MVMContext *",
    "struct MVMContinuation *",
    "struct MVMDLLSym *",
    "struct MVMDecoder *",
    "struct MVMException *",
    "struct MVMHash *",
    "struct MVMHashAttrStore *",
    "struct MVMIter *",
    "struct MVMKnowHOWAttributeREPR *",
    "struct MVMKnowHOWREPR *",
    "struct MVMMultiCache *",
    "struct MVMMultiDimArray *",
    "struct MVMNFA *",
    "struct MVMNativeCall *",
    "struct MVMNativeRef *",
    "struct MVMNull *",
    "struct MVMOSHandle *",
    "struct MVMP6bigint *",
    "struct MVMP6int *",
    "struct MVMP6num *",
    "struct MVMP6opaque *",
    "struct MVMP6str *",
    "struct MVMReentrantMutex *",
    "struct MVMSemaphore *",
    "struct MVMSerializationContext *",
    "struct MVMSpeshLog *",
    "struct MVMSpeshPluginState *",
    "struct MVMStaticFrame *",
    "struct MVMString *",
    "struct MVMThread *",
    "struct MVMUninstantiable *",
    "struct MVMSpeshCandidate *",
];

const GEN2_TYPES: &[&str] = &[
    "struct MVMCompUnit *",
    "struct MVMStaticFrameSpesh *",
];

const ALLOCATORS: &[&str] = &[
    "MVMDLLSym_initialize",
    "MVM_6model_bootstrap",
    "MVM_6model_can_method",
    "MVM_6model_can_method_cache_only",
    "MVM_6model_find_method",
    "MVM_6model_find_method_cache_only",
    "MVM_6model_find_method_spesh",
    "MVM_6model_get_how",
    "MVM_6model_get_how_obj",
    "MVM_6model_istype",
    "MVM_6model_parametric_setup",
    "MVM_args_assert_void_return_ok",
    "MVM_args_bind_failed",
    "MVM_args_save_capture",
    "MVM_args_set_result_int",
    "MVM_args_set_result_num",
    "MVM_args_set_result_obj",
    "MVM_args_set_result_str",
    "MVM_args_use_capture",
    "MVM_backend_config",
    "MVM_bigint_div",
    "MVM_bigint_expmod",
    "MVM_bigint_from_bigint",
    "MVM_bigint_from_num",
    "MVM_bigint_mod",
    "MVM_bigint_not",
    "MVM_bigint_pow",
    "MVM_bigint_radix",
    "MVM_bigint_rand",
    "MVM_bigint_shl",
    "MVM_bigint_shr",
    "MVM_bigint_to_str",
    "MVM_bytecode_dump",
    "MVM_bytecode_finish_frame",
    "MVM_bytecode_unpack",
    "MVM_code_location",
    "MVM_coerce_i_s",
    "MVM_coerce_n_s",
    "MVM_coerce_sI",
    "MVM_coerce_smart_intify",
    "MVM_coerce_smart_numify",
    "MVM_coerce_smart_stringify",
    "MVM_coerce_u_s",
    "MVM_concblockingqueue_jit_poll",
    "MVM_concblockingqueue_poll",
    "MVM_conditionvariable_from_lock",
    "MVM_conditionvariable_wait",
    "MVM_confprog_run",
    "MVM_context_apply_traversal",
    "MVM_context_caller_lookup",
    "MVM_context_dynamic_lookup",
    "MVM_context_from_frame",
    "MVM_context_lexical_lookup",
    "MVM_context_lexicals_as_hash",
    "MVM_continuation_control",
    "MVM_continuation_invoke",
    "MVM_cu_from_bytes",
    "MVM_debugserver_breakpoint_check",
    "MVM_debugserver_init",
    "MVM_debugserver_notify_unhandled_exception",
    "MVM_decoder_take_bytes",
    "MVM_dll_find_symbol",
    "MVM_exception_backtrace",
    "MVM_exception_backtrace_strings",
    "MVM_exception_die",
    "MVM_exception_resume",
    "MVM_exception_throwcat",
    "MVM_exception_throwobj",
    "MVM_exception_throwpayload",
    "MVM_file_handle_from_fd",
    "MVM_file_open_fh",
    "MVM_frame_binddynlex",
    "MVM_frame_capture_inner",
    "MVM_frame_capturelex",
    "MVM_frame_create_context_only",
    "MVM_frame_create_for_deopt",
    "MVM_frame_debugserver_move_to_heap",
    "MVM_frame_find_contextual_by_name",
    "MVM_frame_find_dynamic_using_frame_walker",
    "MVM_frame_find_lexical_by_name",
    "MVM_frame_find_lexical_by_name_outer",
    "MVM_frame_find_lexical_by_name_rel",
    "MVM_frame_find_lexical_by_name_rel_caller",
    "MVM_frame_force_to_heap",
    "MVM_frame_get_code_object",
    "MVM_frame_getdynlex",
    "MVM_frame_getdynlex_with_frame_walker",
    "MVM_frame_invoke",
    "MVM_frame_invoke_code",
    "MVM_frame_lexical_lookup_using_frame_walker",
    "MVM_frame_move_to_heap",
    "MVM_frame_takeclosure",
    "MVM_frame_try_get_lexical",
    "MVM_frame_try_return",
    "MVM_frame_unwind_to",
    "MVM_frame_vivify_lexical",
    "MVM_gc_allocate",
    "MVM_gc_allocate_frame",
    "MVM_gc_allocate_nursery",
    "MVM_gc_allocate_object",
    "MVM_gc_allocate_stable",
    "MVM_gc_allocate_type_object",
    "MVM_gc_allocate_zeroed",
    "MVM_gc_enter_from_allocator",
    "MVM_gc_enter_from_interrupt",
    "MVM_gc_mark_thread_blocked",
    "MVM_gc_mark_thread_unblocked",
    "MVM_hll_map",
    "MVM_hll_set_config",
    "MVM_hll_sym_get",
    "MVM_intcache_for",
    "MVM_interp_run",
    "MVM_io_accept",
    "MVM_io_bind",
    "MVM_io_close",
    "MVM_io_connect",
    "MVM_io_eof",
    "MVM_io_eventloop_destroy",
    "MVM_io_eventloop_join",
    "MVM_io_eventloop_permit",
    "MVM_io_eventloop_start",
    "MVM_io_file_watch",
    "MVM_io_fileno",
    "MVM_io_flush",
    "MVM_io_flush_standard_handles",
    "MVM_io_get_async_task_handle",
    "MVM_io_get_signals",
    "MVM_io_getport",
    "MVM_io_is_tty",
    "MVM_io_lock",
    "MVM_io_read_bytes",
    "MVM_io_read_bytes_async",
    "MVM_io_resolve_host_name",
    "MVM_io_seek",
    "MVM_io_set_buffer_size",
    "MVM_io_signal_handle",
    "MVM_io_socket_connect_async",
    "MVM_io_socket_create",
    "MVM_io_socket_listen_async",
    "MVM_io_socket_udp_async",
    "MVM_io_tell",
    "MVM_io_timer_create",
    "MVM_io_truncate",
    "MVM_io_unlock",
    "MVM_io_write_bytes",
    "MVM_io_write_bytes_async",
    "MVM_io_write_bytes_c",
    "MVM_io_write_bytes_to_async",
    "MVM_iter",
    "MVM_jit_emit_block_branch",
    "MVM_jit_emit_branch",
    "MVM_jit_emit_guard",
    "MVM_jit_emit_invoke",
    "MVM_jit_emit_primitive",
    "MVM_load_bytecode",
    "MVM_load_bytecode_buffer",
    "MVM_load_bytecode_buffer_to_cu",
    "MVM_load_bytecode_fh",
    "MVM_multi_cache_add",
    "MVM_nativecall_cast",
    "MVM_nativecall_global",
    "MVM_nativecall_invoke",
    "MVM_nativecall_jit_graph_for_caller_code",
    "MVM_nativecall_make_int",
    "MVM_nativecall_make_num",
    "MVM_nativecall_make_str",
    "MVM_nativecall_make_uint",
    "MVM_nativeref_attr_i",
    "MVM_nativeref_attr_n",
    "MVM_nativeref_attr_s",
    "MVM_nativeref_lex_i",
    "MVM_nativeref_lex_n",
    "MVM_nativeref_lex_name_i",
    "MVM_nativeref_lex_name_n",
    "MVM_nativeref_lex_name_s",
    "MVM_nativeref_lex_s",
    "MVM_nativeref_multidim_i",
    "MVM_nativeref_multidim_n",
    "MVM_nativeref_multidim_s",
    "MVM_nativeref_pos_i",
    "MVM_nativeref_pos_n",
    "MVM_nativeref_pos_s",
    "MVM_nfa_from_statelist",
    "MVM_nfa_run_proto",
    "MVM_platform_uname",
    "MVM_proc_getenvhash",
    "MVM_profile_dump_instrumented_data",
    "MVM_profile_end",
    "MVM_profile_heap_end",
    "MVM_profile_instrumented_end",
    "MVM_radix",
    "MVM_reentrantmutex_lock",
    "MVM_reentrantmutex_lock_checked",
    "MVM_repr_alloc_init",
    "MVM_repr_box_int",
    "MVM_repr_box_num",
    "MVM_repr_box_str",
    "MVM_repr_box_uint",
    "MVM_repr_dimensions",
    "MVM_repr_pos_slice",
    "MVM_sc_disclaim",
    "MVM_sc_get_code",
    "MVM_sc_get_object",
    "MVM_sc_get_sc_object",
    "MVM_sc_get_stable",
    "MVM_semaphore_acquire",
    "MVM_serialization_demand_code",
    "MVM_serialization_demand_object",
    "MVM_serialization_demand_stable",
    "MVM_serialization_deserialize",
    "MVM_serialization_finish_deserialize_method_cache",
    "MVM_serialization_force_stable",
    "MVM_serialization_read_ref",
    "MVM_serialization_read_stable_ref",
    "MVM_serialization_serialize",
    "MVM_serialization_write_ref",
    "MVM_spesh_candidate_add",
    "MVM_spesh_deopt_all",
    "MVM_spesh_deopt_one",
    "MVM_spesh_facts_discover",
    "MVM_spesh_frame_walker_get_lex",
    "MVM_spesh_frame_walker_get_lexicals_hash",
    "MVM_spesh_inline",
    "MVM_spesh_inline_try_get_graph",
    "MVM_spesh_inline_try_get_graph_from_unspecialized",
    "MVM_spesh_log_create",
    "MVM_spesh_log_decont",
    "MVM_spesh_log_entry",
    "MVM_spesh_log_initialize_thread",
    "MVM_spesh_log_invoke_target",
    "MVM_spesh_log_new_compunit",
    "MVM_spesh_log_osr",
    "MVM_spesh_log_return_to_unlogged",
    "MVM_spesh_log_return_type",
    "MVM_spesh_log_static",
    "MVM_spesh_log_type",
    "MVM_spesh_optimize",
    "MVM_spesh_try_can_method",
    "MVM_spesh_try_find_method",
    "MVM_spesh_worker_join",
    "MVM_spesh_worker_start",
    "MVM_string_ascii_from_buf_nocheck",
    "MVM_string_concatenate",
    "MVM_string_decodestream_get_all",
    "MVM_string_decodestream_get_available",
    "MVM_string_decodestream_get_chars",
    "MVM_string_decodestream_get_until_sep",
    "MVM_string_decodestream_get_until_sep_eof",
    "MVM_string_escape",
    "MVM_string_flip",
    "MVM_string_join",
    "MVM_string_print",
    "MVM_string_repeat",
    "MVM_string_say",
    "MVM_string_split",
    "MVM_string_substring",
    "MVM_thread_join",
    "MVM_thread_join_foreground",
    "MVM_thread_new",
    "MVM_thread_run",
    "MVM_unicode_codepoints_c_array_to_nfg_string",
    "MVM_unicode_codepoints_to_nfg_string",
    "MVM_unicode_string_from_name",
    "MVM_validate_static_frame",
    "MVM_vm_create_instance",
    "MVM_vm_destroy_instance",
    "MVM_vm_dump_file",
    "MVM_vm_exit",
    "MVM_vm_run_bytecode",
    "MVM_vm_run_file",
    "NFG_checker",
    "accepts_type_sr",
    "acquire_mutex",
    "add_attribute",
    "add_bb_facts",
    "add_meta_object",
    "add_method",
    "add_type_to_types_array",
    "allocate",
    "allocate_frame",
    "allocate_heap_frame",
    "async_handler",
    "at_key",
    "at_pos",
    "attr_box_target",
    "attr_compose",
    "attr_name",
    "attr_new",
    "attr_type",
    "attrref",
    "autoclose",
    "bind_error_return",
    "bind_key",
    "boot_typed_array",
    "bootstrap_KnowHOW",
    "box_i",
    "box_s",
    "call_resolver",
    "callback_handler",
    "cancel_work",
    "close_socket",
    "closefh",
    "code_pair_deserialize",
    "code_pair_serialize",
    "collapse_strands",
    "collect_param_interns",
    "commit_entry",
    "compose",
    "compute_allocation_strategy",
    "connect_setup",
    "consume_ins",
    "consume_invoke",
    "continue_unwind",
    "create_KnowHOWAttribute",
    "create_caller_code",
    "create_caller_or_outer_context_debug_handle",
    "create_context_only",
    "create_context_or_code_obj_debug_handle",
    "debugserver_worker",
    "deopt_frame",
    "deserialize",
    "deserialize_closure",
    "deserialize_context",
    "deserialize_frames",
    "deserialize_method_cache_lazy",
    "deserialize_repr_data",
    "deserialize_stable",
    "deserialize_stable_size",
    "do_accepts_type_check",
    "do_case_change",
    "dump_call_graph_node",
    "dump_call_graph_node_loop",
    "dump_data",
    "dump_thread_data",
    "emit_fastcreate",
    "evaluate_guards",
    "exists_key",
    "fastcreate",
    "finalize_handler_caller",
    "fix_wval",
    "flush",
    "flush_output_buffer",
    "get_all_in_buffer",
    "get_attribute",
    "get_method_cache",
    "index_mapping_and_flat_list",
    "initialize",
    "insert_if_not_exists",
    "instrumentation_level_barrier",
    "invoke_handler",
    "lex_ref",
    "lexref_by_name",
    "listen_setup",
    "lock",
    "log_param_type",
    "log_parameter",
    "main",
    "make_wrapper",
    "materialize_object",
    "materialize_replaced_objects",
    "md_posref",
    "merge_graph",
    "mkdir_p",
    "mvm_tell",
    "native_ref_fetch",
    "nativecall_cast",
    "new_array",
    "new_hash",
    "new_type",
    "on_changed",
    "on_connect",
    "on_connection",
    "on_read",
    "on_write",
    "op_to_func",
    "optimize_bb",
    "optimize_bb_switch",
    "optimize_call",
    "optimize_can_op",
    "optimize_method_lookup",
    "optimize_smart_coerce",
    "panic_unhandled_ex",
    "perform_write",
    "permit_work",
    "posref",
    "prepare_and_verify_static_frame",
    "push",
    "push_name_and_port",
    "re_nfg",
    "read_array_int",
    "read_array_str",
    "read_array_var",
    "read_bytes",
    "read_code_ref",
    "read_hash_str_var",
    "read_obj_ref",
    "read_object_table_entry",
    "read_one_packet",
    "read_op",
    "read_param_intern",
    "read_setup",
    "repossess",
    "request_all_threads_resume",
    "request_all_threads_suspend",
    "request_context_lexicals",
    "request_thread_resumes",
    "request_thread_suspends",
    "resolve_param_interns",
    "run_comp_unit",
    "run_deserialization_frame",
    "run_gc",
    "run_handler",
    "run_load",
    "seek",
    "send_log",
    "serialize",
    "serialize_context",
    "serialize_repr_data",
    "serialize_stable",
    "set_buffer_size",
    "setup",
    "setup_for_guard_recording",
    "setup_setup",
    "setup_step",
    "setup_work",
    "shift",
    "signal_cb",
    "socket_accept",
    "socket_bind",
    "socket_connect",
    "socket_read_bytes",
    "socket_write_bytes",
    "spesh",
    "start_thread",
    "stop_point_hit",
    "stub_object",
    "stub_stable",
    "take_chars",
    "toplevel_initial_invoke",
    "try_join",
    "type_object_for",
    "uninline",
    "unlock",
    "unshift",
    "unwind_after_handler",
    "validate_block",
    "validate_lex_operand",
    "validate_operand",
    "validate_operands",
    "validate_sequence",
    "work_loop",
    "worker",
    "write_array_var",
    "write_bytes",
    "write_bytes_to",
    "write_hash_str_var",
    "write_setup",
    "wvalfrom_facts",
];

const MALLOC_LIKE: &[&str] = &[
    "ANSIToUTF8",
    "MVM_bytecode_dump",
    "MVM_calloc",
    "MVM_exception_backtrace_line",
    "MVM_fixed_size_allocate",
    "MVM_fixed_size_allocate_zeroed",
    "MVM_malloc",
    "MVM_nativecall_unmarshal_string",
    "MVM_serialization_read_cstr",
    "MVM_spesh_dump",
    "MVM_spesh_dump_arg_guard",
    "MVM_spesh_dump_planned",
    "MVM_spesh_dump_stats",
    "MVM_staticframe_file_location",
    "MVM_string_ascii_encode",
    "MVM_string_ascii_encode_any",
    "MVM_string_ascii_encode_substr",
    "MVM_string_encode",
    "MVM_string_gb18030_encode_substr",
    "MVM_string_gb2312_encode_substr",
    "MVM_string_latin1_encode",
    "MVM_string_latin1_encode_substr",
    "MVM_string_shiftjis_encode_substr",
    "MVM_string_utf16_encode",
    "MVM_string_utf16_encode_substr",
    "MVM_string_utf16_encode_substr_main",
    "MVM_string_utf16be_encode_substr",
    "MVM_string_utf16le_encode_substr",
    "MVM_string_utf8_c8_encode",
    "MVM_string_utf8_c8_encode_substr",
    "MVM_string_utf8_encode",
    "MVM_string_utf8_encode_C_string",
    "MVM_string_utf8_encode_substr",
    "MVM_string_utf8_maybe_encode_C_string",
    "MVM_string_windows1251_encode_substr",
    "MVM_string_windows1252_encode_substr",
    "MVM_string_windows125X_encode_substr",
    "NFG_check_make_debug_string",
    "NFG_checker",
    "UnicodeToUTF8",
    "base64_encode",
    "callback_handler",
    "get_signature_char",
    "twoway_memmem_uint32",
    "u64toa_naive_worker",
];

const FREE_LIKE: &[&str] = &[
    "MVM_fixed_size_free",
    "MVM_fixed_size_free_at_safepoint",
    "MVM_free",
    "MVM_free_null",
    "MVM_tc_destroy",
    "cleanup_all",
    "free_repr_data",
];

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let c = RootingConfig::default();
        assert!(c.is_tracked("struct MVMObject *"));
        assert!(c.is_tracked("struct MVMString *"));
        assert!(!c.is_tracked("struct MVMCompUnit *"));
        assert!(c.is_gen2("struct MVMCompUnit *"));
        assert!(c.allocators.contains("MVM_repr_alloc_init"));
        assert!(c.allocators.contains("MVM_gc_allocate"));
        assert!(c.malloc_like.contains("MVM_malloc"));
        assert!(c.free_like.contains("MVM_free"));
        assert_eq!(c.max_paths, DEFAULT_MAX_PATHS);
    }

    #[test]
    fn toml_overrides_only_what_it_names() {
        let c = RootingConfig::from_toml(
            r#"
            allocators = ["my_alloc"]
            max_paths = 16
            "#,
        )
        .unwrap();
        assert_eq!(c.allocators, set(&["my_alloc"]));
        assert_eq!(c.max_paths, 16);
        assert_eq!(c.root_push, "MVM_gc_root_temp_push");
        assert!(c.is_tracked("struct MVMObject *"));
    }

    #[test]
    fn bad_toml_is_an_error() {
        assert!(RootingConfig::from_toml("max_paths = \"lots\"").is_err());
    }
}
