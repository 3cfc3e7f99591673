//! Exception handling. The memory subsystem never relies on demand
//! paging or page-fault-driven allocation, but a stray bad access
//! during development should log and halt rather than triple-fault
//! silently.

use lazy_static::lazy_static;
use x86_64::structures::idt::{InterruptDescriptorTable, InterruptStackFrame, PageFaultErrorCode};

use crate::arch::gdt::DOUBLE_FAULT_IST_INDEX;

lazy_static! {
    static ref IDT: InterruptDescriptorTable = {
        let mut idt = InterruptDescriptorTable::new();
        idt.breakpoint.set_handler_fn(breakpoint_handler);
        idt.page_fault.set_handler_fn(page_fault_handler);
        idt.general_protection_fault
            .set_handler_fn(general_protection_fault_handler);
        idt.divide_error.set_handler_fn(divide_error_handler);
        idt.invalid_opcode.set_handler_fn(invalid_opcode_handler);
        unsafe {
            idt.double_fault
                .set_handler_fn(double_fault_handler)
                .set_stack_index(DOUBLE_FAULT_IST_INDEX);
        }
        idt
    };
}

pub fn init() {
    IDT.load();
    crate::kinfo!("IDT loaded");
}

extern "x86-interrupt" fn breakpoint_handler(stack_frame: InterruptStackFrame) {
    crate::kdebug!("EXCEPTION: BREAKPOINT\n{:#?}", stack_frame);
}

extern "x86-interrupt" fn page_fault_handler(
    stack_frame: InterruptStackFrame,
    error_code: PageFaultErrorCode,
) {
    crate::kerror!(
        "EXCEPTION: PAGE FAULT (error: {:?})\n{:#?}",
        error_code,
        stack_frame
    );
    crate::arch::halt_loop();
}

extern "x86-interrupt" fn general_protection_fault_handler(
    stack_frame: InterruptStackFrame,
    error_code: u64,
) {
    crate::kerror!(
        "EXCEPTION: GENERAL PROTECTION FAULT (error: {:#x})\n{:#?}",
        error_code,
        stack_frame
    );
    crate::arch::halt_loop();
}

extern "x86-interrupt" fn divide_error_handler(stack_frame: InterruptStackFrame) {
    crate::kerror!("EXCEPTION: DIVIDE ERROR\n{:#?}", stack_frame);
    crate::arch::halt_loop();
}

extern "x86-interrupt" fn invalid_opcode_handler(stack_frame: InterruptStackFrame) {
    crate::kerror!("EXCEPTION: INVALID OPCODE\n{:#?}", stack_frame);
    crate::arch::halt_loop();
}

extern "x86-interrupt" fn double_fault_handler(
    stack_frame: InterruptStackFrame,
    error_code: u64,
) -> ! {
    crate::kfatal!("EXCEPTION: DOUBLE FAULT (error: {})\n{:#?}", error_code, stack_frame);
    crate::arch::halt_loop()
}
