use std::sync::Arc;

use winit::{
    event::WindowEvent,
    event_loop::{EventLoop, EventLoopProxy},
    window::{Window, WindowAttributes},
};

use crate::{
    gpu::GpuLatticeRenderer,
    sim::{ParameterReader, SimulationParameters},
};

#[cfg(target_arch = "wasm32")]
use crate::sim::{ParameterUpdate, Topology};
#[cfg(target_arch = "wasm32")]
use wasm_bindgen::prelude::*;
#[cfg(target_arch = "wasm32")]
use web_sys::HtmlCanvasElement;
#[cfg(target_arch = "wasm32")]
use winit::platform::web::{EventLoopExtWebSys, WindowAttributesExtWebSys};

pub mod content;
pub mod gpu;
pub mod rendering;
pub mod sim;
pub mod util;

/// Message type for GPU renderer events
pub enum GpuMessage {
    Initialized(GpuLatticeRenderer),
    InitFailed(String),
    SetRunState(RunState),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RunState {
    Running,
    Paused,
    Stopped,
}

/// Driver lifecycle: context loss suspends, restoration re-enters Running
/// with a fresh lattice.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Lifecycle {
    Uninitialized,
    Running,
    Suspended,
    Destroyed,
}

pub struct Application {
    proxy: EventLoopProxy<GpuMessage>,
    window: Option<Arc<Window>>,
    renderer: Option<GpuLatticeRenderer>,
    parameters: ParameterReader,
    run_state: RunState,
    lifecycle: Lifecycle,
}

impl Application {
    pub fn new(event_loop: &EventLoop<GpuMessage>, parameters: ParameterReader) -> Self {
        Self {
            proxy: event_loop.create_proxy(),
            window: None,
            renderer: None,
            parameters,
            run_state: RunState::Running,
            lifecycle: Lifecycle::Uninitialized,
        }
    }

    fn begin_initialization(&self, window: Arc<Window>) {
        let proxy = self.proxy.clone();

        #[cfg(target_arch = "wasm32")]
        wasm_bindgen_futures::spawn_local(async move {
            match GpuLatticeRenderer::new(window).await {
                Ok(renderer) => {
                    let _ = proxy.send_event(GpuMessage::Initialized(renderer));
                }
                Err(e) => {
                    let _ = proxy.send_event(GpuMessage::InitFailed(e.to_string()));
                }
            }
        });

        #[cfg(not(target_arch = "wasm32"))]
        match pollster::block_on(GpuLatticeRenderer::new(window)) {
            Ok(renderer) => {
                let _ = proxy.send_event(GpuMessage::Initialized(renderer));
            }
            Err(e) => {
                let _ = proxy.send_event(GpuMessage::InitFailed(e.to_string()));
            }
        }
    }

    /// Tear down every pre-loss GPU handle, then re-run full initialization.
    /// The lattice restarts from fresh random spins; that is expected.
    fn handle_context_loss(&mut self) {
        log::warn!("GPU context lost; suspending and reinitializing");
        self.renderer = None;
        self.lifecycle = Lifecycle::Suspended;
        if let Some(window) = self.window.clone() {
            self.begin_initialization(window);
        }
    }
}

impl winit::application::ApplicationHandler<GpuMessage> for Application {
    fn resumed(&mut self, event_loop: &winit::event_loop::ActiveEventLoop) {
        if self.window.is_some() {
            return;
        }

        #[cfg(target_arch = "wasm32")]
        let window_attrs = {
            let dom_window = web_sys::window().expect("could not get window");
            let canvas: HtmlCanvasElement = dom_window
                .document()
                .expect("could not get document")
                .get_element_by_id("ising-surface")
                .expect("could not get element with id `ising-surface` as required")
                .dyn_into()
                .expect("`ising-surface` is not a canvas");
            WindowAttributes::default().with_canvas(Some(canvas))
        };

        #[cfg(not(target_arch = "wasm32"))]
        let window_attrs = WindowAttributes::default().with_title("Ising lattice");

        match event_loop.create_window(window_attrs) {
            Ok(window) => {
                let window = Arc::new(window);
                self.window = Some(window.clone());
                self.begin_initialization(window);
            }
            Err(e) => log::error!("failed to create window: {e}"),
        };
    }

    fn window_event(
        &mut self,
        event_loop: &winit::event_loop::ActiveEventLoop,
        _window_id: winit::window::WindowId,
        event: winit::event::WindowEvent,
    ) {
        match event {
            WindowEvent::CloseRequested | WindowEvent::Destroyed => {
                // Dropping the renderer releases program, textures, and
                // surface; late frame callbacks find no renderer and no-op.
                self.renderer = None;
                self.lifecycle = Lifecycle::Destroyed;
            }
            WindowEvent::Resized(size) => {
                if let Some(ref mut renderer) = self.renderer {
                    renderer.resize(size.width, size.height);
                }
            }
            WindowEvent::RedrawRequested => {
                if self.lifecycle == Lifecycle::Destroyed {
                    return;
                }
                if gpu::is_context_lost() && self.renderer.is_some() {
                    self.handle_context_loss();
                    return;
                }
                if let Some(ref mut renderer) = self.renderer {
                    let result = match self.run_state {
                        RunState::Stopped => {
                            // Stopped: show current state, don't request more redraws
                            renderer.render()
                        }
                        RunState::Paused => {
                            // Paused: keep the animation loop going without stepping
                            let r = renderer.render();
                            if r.is_ok() {
                                renderer.request_redraw();
                            }
                            r
                        }
                        RunState::Running => {
                            let parameters = self.parameters.snapshot();
                            let r = renderer.step_and_render(parameters);
                            if r.is_ok() {
                                renderer.request_redraw();
                            }
                            r
                        }
                    };

                    match result {
                        Ok(()) => {}
                        Err(wgpu::SurfaceError::Lost) | Err(wgpu::SurfaceError::Outdated) => {
                            renderer.reconfigure_surface();
                            if self.run_state != RunState::Stopped {
                                renderer.request_redraw();
                            }
                        }
                        Err(wgpu::SurfaceError::OutOfMemory) => {
                            log::error!("Out of memory!");
                            event_loop.exit();
                        }
                        Err(e) => {
                            log::warn!("Surface error: {e:?}");
                            if self.run_state != RunState::Stopped {
                                renderer.request_redraw();
                            }
                        }
                    }
                }
            }
            _ => (),
        };
    }

    fn user_event(&mut self, _event_loop: &winit::event_loop::ActiveEventLoop, event: GpuMessage) {
        match event {
            GpuMessage::Initialized(renderer) => {
                if self.lifecycle == Lifecycle::Destroyed {
                    return;
                }
                gpu::reset_context_lost();
                if self.lifecycle == Lifecycle::Suspended {
                    log::info!("GPU context restored; resuming with a fresh lattice");
                } else {
                    log::info!("GPU renderer initialized successfully");
                }
                // Request first redraw to kick off the animation loop
                renderer.request_redraw();
                self.renderer = Some(renderer);
                self.lifecycle = Lifecycle::Running;
            }
            GpuMessage::InitFailed(e) => {
                log::error!("GPU initialization error: {e}");
                #[cfg(target_arch = "wasm32")]
                show_failure(&e);
            }
            GpuMessage::SetRunState(state) => {
                if self.run_state == state {
                    return;
                }
                self.run_state = state;
                log::info!("Simulation {state:?}");
                if state != RunState::Stopped {
                    // A stopped loop has no pending redraw to carry it.
                    if let Some(ref renderer) = self.renderer {
                        renderer.request_redraw();
                    }
                }
            }
        }
    }
}

/// Write the failure into the page so a missing GPU context degrades to a
/// visible message instead of a silent blank canvas.
#[cfg(target_arch = "wasm32")]
fn show_failure(message: &str) {
    let element = web_sys::window()
        .and_then(|w| w.document())
        .and_then(|d| d.get_element_by_id("ising-error"));
    if let Some(element) = element {
        element.set_text_content(Some(message));
    }
}

#[cfg(target_arch = "wasm32")]
#[wasm_bindgen(start)]
pub fn initialize() {
    console_error_panic_hook::set_once();
    let _ = fern::Dispatch::new()
        .format(|out, message, record| {
            out.finish(format_args!(
                "[{} {}] {}",
                record.level(),
                record.target(),
                message
            ))
        })
        .level(log::LevelFilter::Debug)
        .chain(fern::Output::call(console_log::log))
        .apply();
}

/// Start the visualization and hand back the control surface for the page's
/// sliders.
#[cfg(target_arch = "wasm32")]
#[wasm_bindgen]
pub fn start() -> Result<IsingController, JsValue> {
    log::info!("Starting Ising lattice visualization");

    let event_loop = EventLoop::<GpuMessage>::with_user_event()
        .build()
        .map_err(|e| JsValue::from_str(&format!("failed to create event loop: {e}")))?;

    let (writer, reader) = sim::parameter_bridge(SimulationParameters::default());
    let controller = IsingController {
        parameters: writer,
        proxy: event_loop.create_proxy(),
        run_state: RunState::Running,
    };

    // The explanatory side panel fetches its markdown once; parsing happens
    // here, display belongs to the page.
    wasm_bindgen_futures::spawn_local(async {
        match content::fetch_content("/content.md").await {
            Ok(text) => {
                let nodes = content::parse_markdown(&text);
                log::info!("Loaded explanatory content: {} top-level nodes", nodes.len());
            }
            Err(e) => log::warn!("Failed to load explanatory content: {e}"),
        }
    });

    let app = Application::new(&event_loop, reader);
    event_loop.spawn_app(app);

    Ok(controller)
}

/// Run the visualization natively, with default parameters.
#[cfg(not(target_arch = "wasm32"))]
pub fn run() -> Result<(), anyhow::Error> {
    log::info!("Starting Ising lattice visualization");

    let event_loop = EventLoop::<GpuMessage>::with_user_event().build()?;
    let (_writer, reader) = sim::parameter_bridge(SimulationParameters::default());
    let mut app = Application::new(&event_loop, reader);
    event_loop.run_app(&mut app)?;
    Ok(())
}

/// Controller for the running simulation: the parameter bridge's write half
/// plus run control, exposed to the page.
#[cfg(target_arch = "wasm32")]
#[wasm_bindgen]
pub struct IsingController {
    parameters: sim::ParameterWriter,
    proxy: EventLoopProxy<GpuMessage>,
    run_state: RunState,
}

#[cfg(target_arch = "wasm32")]
#[wasm_bindgen]
impl IsingController {
    /// Set temperature T (UI range 0-10)
    #[wasm_bindgen]
    pub fn set_temperature(&mut self, value: f32) {
        self.parameters.apply(ParameterUpdate {
            temperature: Some(value),
            ..Default::default()
        });
    }

    /// Set coupling strength J (UI range 0-5)
    #[wasm_bindgen]
    pub fn set_coupling(&mut self, value: f32) {
        self.parameters.apply(ParameterUpdate {
            coupling: Some(value),
            ..Default::default()
        });
    }

    /// Set external field H (UI range -2 to 2)
    #[wasm_bindgen]
    pub fn set_field(&mut self, value: f32) {
        self.parameters.apply(ParameterUpdate {
            field: Some(value),
            ..Default::default()
        });
    }

    /// Set evolution speed (UI range 0.1-5)
    #[wasm_bindgen]
    pub fn set_speed(&mut self, value: f32) {
        self.parameters.apply(ParameterUpdate {
            speed: Some(value),
            ..Default::default()
        });
    }

    /// Set the topology by selector index (0-4); unknown indices are ignored
    #[wasm_bindgen]
    pub fn set_topology(&mut self, index: u32) {
        match Topology::from_index(index) {
            Some(topology) => self.parameters.apply(ParameterUpdate {
                topology: Some(topology),
                ..Default::default()
            }),
            None => log::warn!("Ignoring unknown topology selector {index}"),
        }
    }

    #[wasm_bindgen]
    pub fn get_temperature(&self) -> f32 {
        self.parameters.current().temperature
    }

    #[wasm_bindgen]
    pub fn get_coupling(&self) -> f32 {
        self.parameters.current().coupling
    }

    #[wasm_bindgen]
    pub fn get_field(&self) -> f32 {
        self.parameters.current().field
    }

    #[wasm_bindgen]
    pub fn get_speed(&self) -> f32 {
        self.parameters.current().speed
    }

    #[wasm_bindgen]
    pub fn get_topology(&self) -> u32 {
        self.parameters.current().topology as u32
    }

    /// Human-readable label for a topology selector, for building the menu
    #[wasm_bindgen]
    pub fn topology_label(index: u32) -> Option<String> {
        Topology::from_index(index).map(|t| t.label().to_string())
    }

    /// Toggle pause state
    #[wasm_bindgen]
    pub fn toggle_pause(&mut self) {
        let next = if self.run_state == RunState::Paused {
            RunState::Running
        } else {
            RunState::Paused
        };
        self.set_run_state(next);
    }

    /// Stop the simulation
    #[wasm_bindgen]
    pub fn stop(&mut self) {
        self.set_run_state(RunState::Stopped);
    }

    /// Resume the simulation (after pause or stop)
    #[wasm_bindgen]
    pub fn resume(&mut self) {
        self.set_run_state(RunState::Running);
    }

    #[wasm_bindgen]
    pub fn is_paused(&self) -> bool {
        self.run_state == RunState::Paused
    }

    #[wasm_bindgen]
    pub fn is_stopped(&self) -> bool {
        self.run_state == RunState::Stopped
    }

    fn set_run_state(&mut self, state: RunState) {
        self.run_state = state;
        let _ = self.proxy.send_event(GpuMessage::SetRunState(state));
    }
}
